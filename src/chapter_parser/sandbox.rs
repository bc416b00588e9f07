//! 解包后脚本的受限求值环境。
//!
//! 只认识数据字面量、变量绑定、成员访问、`+` 拼接，以及三个注入的函数：
//! `atob`、`JSON.parse` 和回传对象的 `run`。没有文件、网络或其它全局对象。
//! 求值在独立线程里进行，调用方限时等待；超时或出错时取消标志会被置位，
//! 工作线程在下一步检查时退出。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use crossbeam_channel as channel;
use serde_json::{Map, Number, Value};
use thiserror::Error;
use tracing::debug;

use super::unpacker;

const DEFAULT_STEP_BUDGET: u64 = 1_000_000;
/// 括号与字面量的最大嵌套层数，与 serde_json 的递归上限一致。
const MAX_NESTING: usize = 128;

/// `atob` 对缺失的 `=` 填充宽容处理。
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("malformed packer arguments: {0}")]
    BadPacker(String),
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("step budget exhausted")]
    BudgetExhausted,
    #[error("evaluation cancelled")]
    Cancelled,
    #[error("evaluation timed out after {0:?}")]
    TimedOut(Duration),
    #[error("payload finished without calling {0}.run")]
    NoCapture(String),
    #[error("evaluation worker terminated unexpectedly")]
    WorkerLost,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    sink_name: String,
    timeout: Duration,
    step_budget: u64,
    #[cfg(test)]
    stall: Option<Arc<StallHook>>,
}

impl Sandbox {
    pub fn new(sink_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            sink_name: sink_name.into(),
            timeout,
            step_budget: DEFAULT_STEP_BUDGET,
            #[cfg(test)]
            stall: None,
        }
    }

    pub fn with_step_budget(mut self, steps: u64) -> Self {
        self.step_budget = steps;
        self
    }

    /// 解包并求值，返回脚本交给回传对象的值。
    pub fn evaluate(&self, packed_script: &str) -> Result<Value, EvalError> {
        let script = packed_script.to_string();
        let sink = self.sink_name.clone();
        let budget = self.step_budget;

        let cancel = CancelOnDrop(Arc::new(AtomicBool::new(false)));
        let worker_cancel = Arc::clone(&cancel.0);
        let (tx, rx) = channel::bounded(1);
        #[cfg(test)]
        let stall = self.stall.clone();

        let handle = thread::Builder::new()
            .name("payload-eval".to_string())
            .spawn(move || {
                #[cfg(test)]
                {
                    if let Some(hook) = stall.as_ref() {
                        hook.hold(&worker_cancel);
                    }
                }
                let result = run_script(&script, &sink, budget, &worker_cancel);
                #[cfg(test)]
                {
                    if let Some(hook) = stall.as_ref() {
                        hook.finish(&result);
                    }
                }
                let _ = tx.send(result);
            })
            .map_err(|e| EvalError::Runtime(format!("spawn evaluator: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => {
                let _ = handle.join();
                result
            }
            Err(channel::RecvTimeoutError::Timeout) => {
                // 不 join：返回时 CancelOnDrop 置位，工作线程在下一次检查时退出
                debug!("payload evaluation exceeded {:?}", self.timeout);
                Err(EvalError::TimedOut(self.timeout))
            }
            Err(channel::RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                Err(EvalError::WorkerLost)
            }
        }
    }
}

/// 离开作用域时置位取消标志，覆盖超时与提前返回。
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// 测试用：让工作线程在开始求值前停住，直到取消标志置位。
#[cfg(test)]
#[derive(Debug, Default)]
struct StallHook {
    exited: AtomicBool,
    saw_cancel: AtomicBool,
}

#[cfg(test)]
impl StallHook {
    fn hold(&self, cancel: &AtomicBool) {
        while !cancel.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn finish(&self, result: &Result<Value, EvalError>) {
        self.saw_cancel
            .store(matches!(result, Err(EvalError::Cancelled)), Ordering::SeqCst);
        self.exited.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn run_script(
    script: &str,
    sink_name: &str,
    step_budget: u64,
    cancel: &AtomicBool,
) -> Result<Value, EvalError> {
    let source = unpacker::unpack_all(script, cancel)?;
    let tokens = tokenize(&source, cancel)?;
    let mut interp = Interpreter {
        tokens,
        pos: 0,
        env: HashMap::new(),
        sink_name,
        steps_left: step_budget,
        depth: 0,
        cancel,
    };
    match interp.run_program() {
        Ok(()) => Err(EvalError::NoCapture(sink_name.to_string())),
        Err(Halt::Captured(value)) => Ok(value),
        Err(Halt::Failed(err)) => Err(err),
    }
}

// ── 词法 ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    Punct(char),
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    offset: usize,
}

/// 解释器不支持的控制流与声明关键字。
const RESERVED: &[&str] = &[
    "if", "else", "for", "while", "do", "function", "return", "new", "this", "class", "try",
    "catch", "throw", "switch", "import", "export", "delete", "typeof", "void", "with",
];

const PUNCT: &[char] = &['{', '}', '[', ']', '(', ')', ',', ':', ';', '.', '=', '+', '-'];

fn tokenize(src: &str, cancel: &AtomicBool) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if cancel.load(Ordering::Relaxed) {
            return Err(EvalError::Cancelled);
        }
        let (offset, ch) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if ch.is_whitespace() {
            i += 1;
        } else if ch == '/' && next == Some('/') {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
        } else if ch == '/' && next == Some('*') {
            i += 2;
            while i + 1 < chars.len() && !(chars[i].1 == '*' && chars[i + 1].1 == '/') {
                i += 1;
            }
            i += 2;
        } else if ch == '"' || ch == '\'' {
            let (text, consumed) = read_string(&chars[i..], offset)?;
            tokens.push(Token {
                tok: Tok::Str(text),
                offset,
            });
            i += consumed;
        } else if ch.is_ascii_digit() || (ch == '.' && next.is_some_and(|c| c.is_ascii_digit())) {
            let start = i;
            i = scan_number(&chars, i);
            let literal = text_of(&chars[start..i]);
            tokens.push(Token {
                tok: Tok::Num(parse_number(&literal, offset)?),
                offset,
            });
        } else if ch.is_alphabetic() || ch == '_' || ch == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '$')
            {
                i += 1;
            }
            tokens.push(Token {
                tok: Tok::Ident(text_of(&chars[start..i])),
                offset,
            });
        } else if PUNCT.contains(&ch) {
            tokens.push(Token {
                tok: Tok::Punct(ch),
                offset,
            });
            i += 1;
        } else {
            return Err(EvalError::Syntax {
                offset,
                message: format!("unsupported character {ch:?}"),
            });
        }
    }

    tokens.push(Token {
        tok: Tok::Eof,
        offset: src.len(),
    });
    Ok(tokens)
}

/// 返回数字字面量结束处的下标。
fn scan_number(chars: &[(usize, char)], mut i: usize) -> usize {
    let is_digit = |i: usize| chars.get(i).is_some_and(|(_, c)| c.is_ascii_digit());

    if chars[i].1 == '0' && chars.get(i + 1).is_some_and(|(_, c)| matches!(c, 'x' | 'X')) {
        i += 2;
        while chars.get(i).is_some_and(|(_, c)| c.is_ascii_hexdigit()) {
            i += 1;
        }
        return i;
    }

    while is_digit(i) {
        i += 1;
    }
    if chars.get(i).is_some_and(|(_, c)| *c == '.') && is_digit(i + 1) {
        i += 1;
        while is_digit(i) {
            i += 1;
        }
    }
    if chars.get(i).is_some_and(|(_, c)| matches!(c, 'e' | 'E')) {
        let mut j = i + 1;
        if chars.get(j).is_some_and(|(_, c)| matches!(c, '+' | '-')) {
            j += 1;
        }
        if is_digit(j) {
            i = j;
            while is_digit(i) {
                i += 1;
            }
        }
    }
    i
}

fn text_of(chars: &[(usize, char)]) -> String {
    chars.iter().map(|(_, c)| *c).collect()
}

fn parse_number(literal: &str, offset: usize) -> Result<f64, EvalError> {
    let parsed = if let Some(hex) = literal
        .strip_prefix("0x")
        .or_else(|| literal.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).ok().map(|v| v as f64)
    } else {
        literal.parse::<f64>().ok()
    };
    parsed.ok_or_else(|| EvalError::Syntax {
        offset,
        message: format!("bad number literal {literal}"),
    })
}

/// 读取一个带引号的字符串字面量，返回内容与消耗的字符数。
fn read_string(chars: &[(usize, char)], offset: usize) -> Result<(String, usize), EvalError> {
    let quote = chars[0].1;
    let mut out = String::new();
    let mut i = 1;
    while i < chars.len() {
        let ch = chars[i].1;
        if ch == quote {
            return Ok((out, i + 1));
        }
        if ch == '\n' {
            break;
        }
        if ch == '\\' {
            let rest: Vec<char> = chars[i + 1..].iter().take(5).map(|(_, c)| *c).collect();
            let (decoded, used) = decode_escape(&rest);
            if let Some(c) = decoded {
                out.push(c);
            }
            i += 1 + used;
            continue;
        }
        out.push(ch);
        i += 1;
    }
    Err(EvalError::Syntax {
        offset,
        message: "unterminated string literal".to_string(),
    })
}

/// 解析反斜杠之后的转义序列，返回得到的字符与消耗的字符数。
fn decode_escape(rest: &[char]) -> (Option<char>, usize) {
    let Some(&c) = rest.first() else {
        return (None, 0);
    };
    let hex = |digits: &[char]| -> Option<char> {
        let text: String = digits.iter().collect();
        u32::from_str_radix(&text, 16).ok().and_then(char::from_u32)
    };
    match c {
        'n' => (Some('\n'), 1),
        'r' => (Some('\r'), 1),
        't' => (Some('\t'), 1),
        'b' => (Some('\u{8}'), 1),
        'f' => (Some('\u{c}'), 1),
        'v' => (Some('\u{b}'), 1),
        '0' => (Some('\0'), 1),
        // 续行
        '\n' => (None, 1),
        'x' if rest.len() >= 3 => match hex(&rest[1..3]) {
            Some(ch) => (Some(ch), 3),
            None => (Some('x'), 1),
        },
        'u' if rest.len() >= 5 => match hex(&rest[1..5]) {
            Some(ch) => (Some(ch), 5),
            None => (Some('u'), 1),
        },
        other => (Some(other), 1),
    }
}

/// 按 JS 字符串规则反转义（不含外层引号）。
pub(crate) fn unescape_js_string(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' {
            let end = (i + 6).min(chars.len());
            match decode_escape(&chars[i + 1..end]) {
                // 末尾孤立的反斜杠
                (_, 0) => {
                    out.push('\\');
                    i += 1;
                }
                (decoded, used) => {
                    if let Some(c) = decoded {
                        out.push(c);
                    }
                    i += 1 + used;
                }
            }
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

// ── 求值 ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Atob,
    Json,
    JsonParse,
    Sink,
    SinkRun,
    Global,
}

#[derive(Debug, Clone)]
enum Val {
    Data(Value),
    Undefined,
    Builtin(Builtin),
}

/// 求值中止的两种原因：拿到回传值，或出错。
enum Halt {
    Captured(Value),
    Failed(EvalError),
}

impl From<EvalError> for Halt {
    fn from(err: EvalError) -> Self {
        Halt::Failed(err)
    }
}

struct Interpreter<'a> {
    tokens: Vec<Token>,
    pos: usize,
    env: HashMap<String, Val>,
    sink_name: &'a str,
    steps_left: u64,
    depth: usize,
    cancel: &'a AtomicBool,
}

impl Interpreter<'_> {
    fn run_program(&mut self) -> Result<(), Halt> {
        while !self.at(&Tok::Eof) {
            self.statement()?;
        }
        Ok(())
    }

    fn tick(&mut self) -> Result<(), Halt> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(EvalError::Cancelled.into());
        }
        if self.steps_left == 0 {
            return Err(EvalError::BudgetExhausted.into());
        }
        self.steps_left -= 1;
        Ok(())
    }

    /// 进入一层嵌套求值；超过 `MAX_NESTING` 视为语法错误，避免递归耗尽线程栈。
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, Halt>) -> Result<T, Halt> {
        if self.depth >= MAX_NESTING {
            return Err(self.syntax(format!("nesting deeper than {MAX_NESTING}")));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    /// 值经变量反复包裹也可能嵌套过深，按节点计步并检查层数。
    fn check_nesting(&mut self, value: &Value) -> Result<(), Halt> {
        let mut pending = vec![(value, 1usize)];
        while let Some((v, level)) = pending.pop() {
            if !(v.is_array() || v.is_object()) {
                continue;
            }
            self.tick()?;
            if level > MAX_NESTING {
                return Err(EvalError::Runtime(format!("value nested deeper than {MAX_NESTING}")).into());
            }
            match v {
                Value::Array(items) => pending.extend(items.iter().map(|c| (c, level + 1))),
                Value::Object(map) => pending.extend(map.values().map(|c| (c, level + 1))),
                _ => {}
            }
        }
        Ok(())
    }

    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].offset
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn bump(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat_punct(&mut self, ch: char) -> bool {
        if self.at(&Tok::Punct(ch)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, ch: char) -> Result<(), Halt> {
        if self.eat_punct(ch) {
            Ok(())
        } else {
            Err(self.syntax(format!("expected '{ch}', found {:?}", self.peek())))
        }
    }

    fn syntax(&self, message: String) -> Halt {
        Halt::Failed(EvalError::Syntax {
            offset: self.offset(),
            message,
        })
    }

    fn statement(&mut self) -> Result<(), Halt> {
        self.tick()?;
        if self.eat_punct(';') {
            return Ok(());
        }
        if let Tok::Ident(kw) = self.peek()
            && matches!(kw.as_str(), "var" | "let" | "const")
        {
            self.bump();
            loop {
                let name = match self.bump() {
                    Tok::Ident(name) => name,
                    other => return Err(self.syntax(format!("expected binding name, found {other:?}"))),
                };
                let value = if self.eat_punct('=') {
                    self.expression()?
                } else {
                    Val::Undefined
                };
                self.env.insert(name, value);
                if !self.eat_punct(',') {
                    break;
                }
            }
        } else {
            // 赋值语句 `name = expr`
            if let Tok::Ident(name) = self.peek().clone()
                && self.tokens.get(self.pos + 1).map(|t| &t.tok) == Some(&Tok::Punct('='))
            {
                self.pos += 2;
                let value = self.expression()?;
                self.env.insert(name, value);
            } else {
                self.expression()?;
            }
        }

        if !self.eat_punct(';') && !self.at(&Tok::Eof) {
            return Err(self.syntax(format!("unexpected token {:?}", self.peek())));
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Val, Halt> {
        let mut left = self.unary()?;
        while self.eat_punct('+') {
            let right = self.unary()?;
            left = self.add(left, right)?;
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Val, Halt> {
        if self.eat_punct('-') {
            return match self.nested(Self::unary)? {
                Val::Data(Value::Number(n)) => Ok(number(-n.as_f64().unwrap_or(0.0))),
                other => Err(EvalError::Runtime(format!("cannot negate {}", describe(&other))).into()),
            };
        }
        if self.eat_punct('+') {
            return self.nested(Self::unary);
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Val, Halt> {
        let mut value = self.primary()?;
        loop {
            self.tick()?;
            if self.eat_punct('.') {
                let name = match self.bump() {
                    Tok::Ident(name) => name,
                    other => return Err(self.syntax(format!("expected property name, found {other:?}"))),
                };
                value = self.member(value, &name)?;
            } else if self.eat_punct('[') {
                let key = self.nested(Self::expression)?;
                self.expect_punct(']')?;
                let key = match key {
                    Val::Data(Value::String(s)) => s,
                    Val::Data(Value::Number(n)) => format_number(&n),
                    other => {
                        return Err(EvalError::Runtime(format!("bad index {}", describe(&other))).into());
                    }
                };
                value = self.member(value, &key)?;
            } else if self.eat_punct('(') {
                let mut args = Vec::new();
                if !self.eat_punct(')') {
                    loop {
                        args.push(self.nested(Self::expression)?);
                        if self.eat_punct(')') {
                            break;
                        }
                        self.expect_punct(',')?;
                    }
                }
                value = self.call(value, args)?;
            } else {
                return Ok(value);
            }
        }
    }

    fn primary(&mut self) -> Result<Val, Halt> {
        self.tick()?;
        match self.bump() {
            Tok::Str(s) => Ok(Val::Data(Value::String(s))),
            Tok::Num(n) => Ok(number(n)),
            Tok::Ident(name) if RESERVED.contains(&name.as_str()) => {
                Err(self.syntax(format!("unsupported keyword '{name}'")))
            }
            Tok::Ident(name) => Ok(self.identifier(&name)),
            Tok::Punct('(') => {
                let value = self.nested(Self::expression)?;
                self.expect_punct(')')?;
                Ok(value)
            }
            Tok::Punct('{') => self.nested(Self::object_literal),
            Tok::Punct('[') => self.nested(Self::array_literal),
            other => Err(self.syntax(format!("unexpected token {other:?}"))),
        }
    }

    fn identifier(&self, name: &str) -> Val {
        match name {
            "true" => Val::Data(Value::Bool(true)),
            "false" => Val::Data(Value::Bool(false)),
            "null" => Val::Data(Value::Null),
            "undefined" => Val::Undefined,
            _ => self
                .env
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.global(name)),
        }
    }

    fn global(&self, name: &str) -> Val {
        match name {
            "atob" => Val::Builtin(Builtin::Atob),
            "JSON" => Val::Builtin(Builtin::Json),
            "window" | "globalThis" | "global" | "self" => Val::Builtin(Builtin::Global),
            n if n == self.sink_name => Val::Builtin(Builtin::Sink),
            _ => Val::Undefined,
        }
    }

    fn object_literal(&mut self) -> Result<Val, Halt> {
        let mut map = Map::new();
        loop {
            if self.eat_punct('}') {
                break;
            }
            let key = match self.bump() {
                Tok::Ident(k) | Tok::Str(k) => k,
                Tok::Num(n) => number_key(n),
                other => return Err(self.syntax(format!("bad object key {other:?}"))),
            };
            self.expect_punct(':')?;
            let value = into_data(self.expression()?)?;
            self.check_nesting(&value)?;
            map.insert(key, value);
            if !self.eat_punct(',') {
                self.expect_punct('}')?;
                break;
            }
        }
        Ok(Val::Data(Value::Object(map)))
    }

    fn array_literal(&mut self) -> Result<Val, Halt> {
        let mut items = Vec::new();
        loop {
            if self.eat_punct(']') {
                break;
            }
            let value = into_data(self.expression()?)?;
            self.check_nesting(&value)?;
            items.push(value);
            if !self.eat_punct(',') {
                self.expect_punct(']')?;
                break;
            }
        }
        Ok(Val::Data(Value::Array(items)))
    }

    fn member(&self, target: Val, name: &str) -> Result<Val, Halt> {
        let found = match target {
            Val::Builtin(Builtin::Json) if name == "parse" => Val::Builtin(Builtin::JsonParse),
            Val::Builtin(Builtin::Sink) if name == "run" => Val::Builtin(Builtin::SinkRun),
            Val::Builtin(Builtin::Global) => self.global(name),
            Val::Builtin(_) => Val::Undefined,
            Val::Data(Value::Object(map)) => map.get(name).cloned().map_or(Val::Undefined, Val::Data),
            Val::Data(Value::Array(items)) => {
                if name == "length" {
                    number(items.len() as f64)
                } else {
                    name.parse::<usize>()
                        .ok()
                        .and_then(|i| items.get(i).cloned())
                        .map_or(Val::Undefined, Val::Data)
                }
            }
            Val::Data(Value::String(s)) if name == "length" => number(s.chars().count() as f64),
            Val::Data(Value::Null) | Val::Undefined => {
                return Err(EvalError::Runtime(format!(
                    "cannot read property '{name}' of null/undefined"
                ))
                .into());
            }
            Val::Data(_) => Val::Undefined,
        };
        Ok(found)
    }

    fn call(&mut self, callee: Val, args: Vec<Val>) -> Result<Val, Halt> {
        let Val::Builtin(builtin) = callee else {
            return Err(EvalError::Runtime(format!("{} is not a function", describe(&callee))).into());
        };
        let first = args.into_iter().next().unwrap_or(Val::Undefined);
        match builtin {
            Builtin::Atob => {
                let Val::Data(Value::String(encoded)) = first else {
                    return Err(EvalError::Runtime("atob expects a string".to_string()).into());
                };
                let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
                let bytes = LENIENT_BASE64
                    .decode(compact.as_bytes())
                    .map_err(|e| EvalError::Runtime(format!("atob: {e}")))?;
                Ok(Val::Data(Value::String(
                    String::from_utf8_lossy(&bytes).into_owned(),
                )))
            }
            Builtin::JsonParse => {
                let Val::Data(Value::String(text)) = first else {
                    return Err(EvalError::Runtime("JSON.parse expects a string".to_string()).into());
                };
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| EvalError::Runtime(format!("JSON.parse: {e}")))?;
                Ok(Val::Data(value))
            }
            Builtin::SinkRun => Err(Halt::Captured(into_data(first)?)),
            other => Err(EvalError::Runtime(format!("{other:?} is not a function")).into()),
        }
    }

    fn add(&self, left: Val, right: Val) -> Result<Val, Halt> {
        match (left, right) {
            (Val::Data(Value::Number(a)), Val::Data(Value::Number(b))) => Ok(number(
                a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0),
            )),
            (l, r) if is_string(&l) || is_string(&r) => Ok(Val::Data(Value::String(format!(
                "{}{}",
                to_js_string(&l),
                to_js_string(&r)
            )))),
            (l, r) => Err(EvalError::Runtime(format!(
                "unsupported operands {} + {}",
                describe(&l),
                describe(&r)
            ))
            .into()),
        }
    }
}

fn is_string(v: &Val) -> bool {
    matches!(v, Val::Data(Value::String(_)))
}

fn number(n: f64) -> Val {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Val::Data(Value::Number(Number::from(n as i64)));
    }
    Val::Data(Number::from_f64(n).map_or(Value::Null, Value::Number))
}

fn number_key(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        (n as i64).to_string()
    } else {
        n.to_string()
    }
}

fn format_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    n.to_string()
}

fn to_js_string(v: &Val) -> String {
    match v {
        Val::Data(Value::String(s)) => s.clone(),
        Val::Data(Value::Number(n)) => format_number(n),
        Val::Data(Value::Bool(b)) => b.to_string(),
        Val::Data(Value::Null) => "null".to_string(),
        Val::Data(Value::Array(_)) => String::new(),
        Val::Data(Value::Object(_)) => "[object Object]".to_string(),
        Val::Undefined => "undefined".to_string(),
        Val::Builtin(_) => "function".to_string(),
    }
}

fn describe(v: &Val) -> &'static str {
    match v {
        Val::Data(Value::String(_)) => "string",
        Val::Data(Value::Number(_)) => "number",
        Val::Data(Value::Bool(_)) => "boolean",
        Val::Data(Value::Null) => "null",
        Val::Data(Value::Array(_)) => "array",
        Val::Data(Value::Object(_)) => "object",
        Val::Undefined => "undefined",
        Val::Builtin(_) => "builtin",
    }
}

fn into_data(v: Val) -> Result<Value, Halt> {
    match v {
        Val::Data(value) => Ok(value),
        Val::Undefined => Ok(Value::Null),
        Val::Builtin(b) => Err(EvalError::Runtime(format!("cannot use {b:?} as data")).into()),
    }
}
