//! `eval(function(p,a,c,k,e,d){...})` 打包脚本的解码。
//!
//! 只实现字典替换这一步：按 `a` 进制把每个编号编码成单词，再把载荷里的单词
//! 换回字典里的原文。不执行打包器自带的函数体。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use regex::Regex;

use super::sandbox::{EvalError, unescape_js_string};

const MAX_DEPTH: usize = 4;
const MAX_RADIX: usize = 62;

fn signature_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"eval\(\s*function\s*\(\s*p\s*,\s*a\s*,\s*c\s*,\s*k\s*,\s*e\s*,\s*[dr]\s*\)")
            .expect("static packer signature regex")
    })
}

fn packed_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?s)eval\(\s*function\s*\(\s*p\s*,\s*a\s*,\s*c\s*,\s*k\s*,\s*e\s*,\s*[dr]\s*\)\s*\{.*?\}",
            r"\s*\(\s*'((?:[^'\\]|\\.)*)'\s*,\s*(\d+)\s*,\s*(\d+)\s*,\s*'((?:[^'\\]|\\.)*)'",
            r"\.split\(\s*'\|'\s*\)(?:\s*,\s*\d+\s*,\s*\{\s*\})?\s*\)\s*\)",
        ))
        .expect("static packer call regex")
    })
}

/// 文本中是否出现打包器特征。
pub fn contains_packer(text: &str) -> bool {
    signature_re().is_match(text)
}

/// 把脚本中的打包调用替换为解码后的源码；嵌套打包最多展开 4 层。
///
/// 每层开始前检查 `cancel`，超时后工作线程不再继续解码。
pub fn unpack_all(script: &str, cancel: &AtomicBool) -> Result<String, EvalError> {
    let mut source = script.to_string();
    for _ in 0..MAX_DEPTH {
        if cancel.load(Ordering::Relaxed) {
            return Err(EvalError::Cancelled);
        }
        let Some(caps) = packed_call_re().captures(&source) else {
            break;
        };
        let range = caps
            .get(0)
            .map(|m| m.range())
            .ok_or_else(|| EvalError::BadPacker("empty match".to_string()))?;

        let payload = unescape_js_string(&caps[1]);
        let radix: usize = caps[2]
            .parse()
            .map_err(|_| EvalError::BadPacker(format!("radix {}", &caps[2])))?;
        let count: usize = caps[3]
            .parse()
            .map_err(|_| EvalError::BadPacker(format!("count {}", &caps[3])))?;
        let words_raw = unescape_js_string(&caps[4]);
        let words: Vec<&str> = words_raw.split('|').collect();

        let decoded = unpack(&payload, radix, count, &words)?;
        source.replace_range(range, &decoded);
    }

    if contains_packer(&source) {
        return Err(EvalError::BadPacker(
            "packer signature present but arguments could not be decoded".to_string(),
        ));
    }
    Ok(source)
}

/// 单层解码。`words[c]` 为空时该编号映射回自身。
pub fn unpack(payload: &str, radix: usize, count: usize, words: &[&str]) -> Result<String, EvalError> {
    if !(2..=MAX_RADIX).contains(&radix) {
        return Err(EvalError::BadPacker(format!("unsupported radix {radix}")));
    }

    let dict = Dictionary {
        radix,
        count,
        words,
    };

    // 与 JS 的 /\b\w+\b/g 一致：只把 ASCII 字母数字和下划线视为单词字符
    let mut out = String::with_capacity(payload.len() * 2);
    let mut word = String::new();
    for ch in payload.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            word.push(ch);
            continue;
        }
        dict.flush(&mut out, &mut word);
        out.push(ch);
    }
    dict.flush(&mut out, &mut word);
    Ok(out)
}

struct Dictionary<'w> {
    radix: usize,
    count: usize,
    words: &'w [&'w str],
}

impl<'w> Dictionary<'w> {
    fn get(&self, word: &str) -> Option<&'w str> {
        let index = decode_word(word, self.radix)?;
        if index >= self.count {
            return None;
        }
        self.words.get(index).copied().filter(|w| !w.is_empty())
    }

    fn flush(&self, out: &mut String, word: &mut String) {
        if word.is_empty() {
            return;
        }
        match self.get(word) {
            Some(replacement) => out.push_str(replacement),
            None => out.push_str(word),
        }
        word.clear();
    }
}

/// 打包器的编号编码：`0-9a-z` 表示 0..36，之后 `A-Z` 表示 36..62。
pub fn encode_word(index: usize, radix: usize) -> String {
    let mut digits = Vec::new();
    let mut n = index;
    loop {
        digits.push(digit_char(n % radix));
        n /= radix;
        if n == 0 {
            break;
        }
    }
    digits.iter().rev().collect()
}

fn digit_char(d: usize) -> char {
    if d > 35 {
        char::from(d as u8 + 29)
    } else {
        char::from_digit(d as u32, 36).unwrap_or('0')
    }
}

fn digit_value(ch: char) -> Option<usize> {
    match ch {
        '0'..='9' => Some(ch as usize - '0' as usize),
        'a'..='z' => Some(ch as usize - 'a' as usize + 10),
        'A'..='Z' => Some(ch as usize - 'A' as usize + 36),
        _ => None,
    }
}

fn decode_word(word: &str, radix: usize) -> Option<usize> {
    let mut value: usize = 0;
    for ch in word.chars() {
        let d = digit_value(ch)?;
        if d >= radix {
            return None;
        }
        value = value.checked_mul(radix)?.checked_add(d)?;
    }
    // 只有规范编码才是字典键（排除前导零等写法）
    if encode_word(value, radix) == word {
        Some(value)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    fn live() -> AtomicBool {
        AtomicBool::new(false)
    }

    /// 测试用打包器：把源码中每个单词收进字典并替换为编号。
    pub(crate) fn pack(source: &str) -> String {
        let radix = 62;
        let mut dict: Vec<String> = Vec::new();
        let mut index_of: HashMap<String, usize> = HashMap::new();
        let mut payload = String::new();
        let mut word = String::new();

        let mut emit = |word: &mut String, payload: &mut String| {
            if word.is_empty() {
                return;
            }
            let idx = *index_of.entry(word.clone()).or_insert_with(|| {
                dict.push(word.clone());
                dict.len() - 1
            });
            payload.push_str(&encode_word(idx, radix));
            word.clear();
        };

        for ch in source.chars() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                word.push(ch);
            } else {
                emit(&mut word, &mut payload);
                payload.push(ch);
            }
        }
        emit(&mut word, &mut payload);

        let escape = |s: &str| s.replace('\\', "\\\\").replace('\'', "\\'");
        format!(
            "eval(function(p,a,c,k,e,d){{e=function(c){{return(c<a?'':e(parseInt(c/a)))+((c=c%a)>35?String.fromCharCode(c+29):c.toString(36))}};if(!''.replace(/^/,String)){{while(c--){{d[e(c)]=k[c]||e(c)}}k=[function(e){{return d[e]}}];e=function(){{return'\\\\w+'}};c=1}};while(c--){{if(k[c]){{p=p.replace(new RegExp('\\\\b'+e(c)+'\\\\b','g'),k[c])}}}}return p}}('{}',{},{},'{}'.split('|'),0,{{}}))",
            escape(&payload),
            radix,
            dict.len(),
            escape(&dict.join("|")),
        )
    }

    #[test]
    fn encodes_like_the_packer() {
        assert_eq!(encode_word(0, 62), "0");
        assert_eq!(encode_word(10, 62), "a");
        assert_eq!(encode_word(35, 62), "z");
        assert_eq!(encode_word(36, 62), "A");
        assert_eq!(encode_word(61, 62), "Z");
        assert_eq!(encode_word(62, 62), "10");
        assert_eq!(encode_word(63, 36), "1r");
    }

    #[test]
    fn decode_word_requires_canonical_form() {
        assert_eq!(decode_word("Z", 62), Some(61));
        assert_eq!(decode_word("10", 62), Some(62));
        assert_eq!(decode_word("01", 62), None);
        assert_eq!(decode_word("Z", 36), None);
    }

    #[test]
    fn unpacks_single_layer() {
        let out = unpack("0 1(2)", 62, 3, &["hello", "world", ""]).unwrap();
        // 空字典项映射回自身
        assert_eq!(out, "hello world(2)");
    }

    #[test]
    fn leaves_unknown_words_untouched() {
        let out = unpack("0.zz_9", 62, 1, &["ts_reader"]).unwrap();
        assert_eq!(out, "ts_reader.zz_9");
    }

    #[test]
    fn round_trips_through_test_packer() {
        let source = "var data={\"n\":\"8://7.6/k.j\"};ts_reader.run(data);";
        let packed = pack(source);
        assert!(contains_packer(&packed));
        assert_eq!(unpack_all(&packed, &live()).unwrap(), source);
    }

    #[test]
    fn unpacks_nested_layers() {
        let inner = "ts_reader.run({'a':1});";
        let packed = pack(&pack(inner));
        assert_eq!(unpack_all(&packed, &live()).unwrap(), inner);
    }

    #[test]
    fn keeps_surrounding_code() {
        let packed = format!("var before=1;{};var after=2;", pack("x(1)"));
        assert_eq!(unpack_all(&packed, &live()).unwrap(), "var before=1;x(1);var after=2;");
    }

    #[test]
    fn cancelled_unpack_stops_before_decoding() {
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            unpack_all(&pack("x(1)"), &cancel),
            Err(EvalError::Cancelled)
        ));
    }

    #[test]
    fn rejects_oversized_radix() {
        assert!(matches!(
            unpack("0", 95, 1, &["x"]),
            Err(EvalError::BadPacker(_))
        ));
    }
}
