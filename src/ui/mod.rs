//! 交互层入口。
//!
//! 目前只有无交互的命令行流程。

pub mod noui;
