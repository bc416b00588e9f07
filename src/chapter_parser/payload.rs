//! 解包脚本回传数据的结构识别。
//!
//! 回传值按顺序尝试两种格式：token 表（模板 + token 列表）与 `sources` 列表。
//! 这里只产出原始 URL 字符串，合法性校验与序号分配在解析器里做。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::ResolutionError;
use crate::base_system::config::ConfigError;

/// token 表格式的改写规则。
///
/// 这些字面量来自单一站点的混淆方式，随时可能变化，因此放在配置里。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenTableRules {
    /// 依次查找的模板字段
    pub template_keys: Vec<String>,
    /// 从根对象到 token 列表的路径，数组下标写成数字字符串
    pub token_path: Vec<String>,
    pub padding_marker: String,
    pub placeholder: String,
    pub scheme_marker: String,
    pub scheme_replacement: String,
    pub host_marker: String,
    pub host_replacement: String,
    pub truncated_extension: String,
    pub extension_completion: String,
}

impl Default for TokenTableRules {
    fn default() -> Self {
        Self {
            template_keys: vec!["n".to_string(), "V".to_string()],
            token_path: vec!["4".to_string(), "0".to_string(), "3".to_string()],
            padding_marker: "==".to_string(),
            placeholder: "k".to_string(),
            scheme_marker: "8://".to_string(),
            scheme_replacement: "https://".to_string(),
            host_marker: "7.6".to_string(),
            host_replacement: "mangatv.net".to_string(),
            truncated_extension: ".j".to_string(),
            extension_completion: "pg".to_string(),
        }
    }
}

impl TokenTableRules {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.template_keys.iter().all(|k| k.is_empty()) {
            return Err(ConfigError::Validation(
                "token_table.template_keys 不能为空".to_string(),
            ));
        }
        if self.token_path.is_empty() {
            return Err(ConfigError::Validation(
                "token_table.token_path 不能为空".to_string(),
            ));
        }
        if self.placeholder.is_empty() {
            return Err(ConfigError::Validation(
                "token_table.placeholder 不能为空".to_string(),
            ));
        }
        Ok(())
    }

    /// 对模板做 scheme / host 改写。
    fn rewrite_template(&self, template: &str) -> String {
        let mut out = template.to_string();
        if !self.scheme_marker.is_empty() {
            out = out.replace(&self.scheme_marker, &self.scheme_replacement);
        }
        if !self.host_marker.is_empty() {
            out = out.replace(&self.host_marker, &self.host_replacement);
        }
        out
    }

    fn expand(&self, template: &str, token: &str) -> String {
        let token = if self.padding_marker.is_empty() {
            token
        } else {
            token.strip_suffix(&self.padding_marker).unwrap_or(token)
        };
        let mut url = template.replace(&self.placeholder, token);
        if !self.truncated_extension.is_empty() && url.ends_with(&self.truncated_extension) {
            url.push_str(&self.extension_completion);
        }
        url
    }
}

/// 从回传值中取出图片 URL 列表，保持数据中的顺序。
pub fn extract_image_urls(
    value: &Value,
    rules: &TokenTableRules,
) -> Result<Vec<String>, ResolutionError> {
    let Value::Object(root) = value else {
        return Err(ResolutionError::UnrecognizedSchema(format!(
            "captured value is {}, expected an object",
            kind_of(value)
        )));
    };

    let template = rules
        .template_keys
        .iter()
        .filter_map(|key| root.get(key))
        .find_map(|v| v.as_str().filter(|s| !s.is_empty()));
    if let Some(template) = template {
        debug!("payload 使用 token 表格式");
        return from_token_table(value, template, rules);
    }

    if let Some(Value::Array(sources)) = root.get("sources")
        && !sources.is_empty()
    {
        debug!("payload 使用 sources 列表格式");
        return from_sources_list(sources);
    }

    let keys: Vec<&str> = root.keys().map(String::as_str).take(20).collect();
    Err(ResolutionError::UnrecognizedSchema(format!(
        "no template field ({}) or sources list; keys: [{}]",
        rules.template_keys.join("/"),
        keys.join(", ")
    )))
}

fn from_token_table(
    root: &Value,
    template: &str,
    rules: &TokenTableRules,
) -> Result<Vec<String>, ResolutionError> {
    let tokens = walk(root, &rules.token_path)
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ResolutionError::UnrecognizedSchema(format!(
                "token list missing at path {}",
                rules.token_path.join("/")
            ))
        })?;
    if tokens.is_empty() {
        return Err(ResolutionError::NoImagesFound);
    }

    let template = rules.rewrite_template(template);
    let mut urls = Vec::with_capacity(tokens.len());
    for (pos, token) in tokens.iter().enumerate() {
        match token.as_str() {
            Some(t) => urls.push(rules.expand(&template, t)),
            None => warn!("token #{} 不是字符串，已跳过: {}", pos, token),
        }
    }
    Ok(urls)
}

fn from_sources_list(sources: &[Value]) -> Result<Vec<String>, ResolutionError> {
    let images = sources
        .first()
        .and_then(|s| s.get("images"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ResolutionError::UnrecognizedSchema("sources[0].images is not a list".to_string())
        })?;
    if images.is_empty() {
        return Err(ResolutionError::NoImagesFound);
    }

    let mut urls = Vec::with_capacity(images.len());
    for (pos, fragment) in images.iter().enumerate() {
        match fragment.as_str() {
            Some(f) => urls.push(normalize_fragment(f)),
            None => warn!("images #{} 不是字符串，已跳过: {}", pos, fragment),
        }
    }
    Ok(urls)
}

/// `//host/x` 补 `https:`，已是 `http` 开头的保持不变，其余补 `https://`。
pub fn normalize_fragment(fragment: &str) -> String {
    if fragment.starts_with("//") {
        format!("https:{fragment}")
    } else if fragment.starts_with("http") {
        fragment.to_string()
    } else {
        format!("https://{fragment}")
    }
}

fn walk<'v>(root: &'v Value, path: &[String]) -> Option<&'v Value> {
    path.iter().try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules() -> TokenTableRules {
        TokenTableRules::default()
    }

    #[test]
    fn token_table_expands_each_token_in_order() {
        let data = json!({
            "n": "8://7.6/uploads/k.j",
            "4": [{"3": ["aaa==", "bbb", "ccc=="]}]
        });
        let urls = extract_image_urls(&data, &rules()).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://mangatv.net/uploads/aaa.jpg",
                "https://mangatv.net/uploads/bbb.jpg",
                "https://mangatv.net/uploads/ccc.jpg",
            ]
        );
    }

    #[test]
    fn falls_back_to_second_template_key() {
        let data = json!({"n": "", "V": "8://7.6/k.png", "4": [{"3": ["t1"]}]});
        let urls = extract_image_urls(&data, &rules()).unwrap();
        assert_eq!(urls, vec!["https://mangatv.net/t1.png"]);
    }

    #[test]
    fn token_table_with_missing_tokens_is_unrecognized() {
        let data = json!({"n": "8://7.6/k.j", "4": []});
        assert!(matches!(
            extract_image_urls(&data, &rules()),
            Err(ResolutionError::UnrecognizedSchema(_))
        ));
    }

    #[test]
    fn empty_token_list_means_no_images() {
        let data = json!({"n": "8://7.6/k.j", "4": [{"3": []}]});
        assert!(matches!(
            extract_image_urls(&data, &rules()),
            Err(ResolutionError::NoImagesFound)
        ));
    }

    #[test]
    fn sources_list_normalizes_fragments() {
        let data = json!({"sources": [{"images": [
            "//cdn.example.com/a/01.jpg",
            "http://plain.example.com/02.jpg",
            "cdn.example.com/03.jpg"
        ]}, {"images": ["ignored"]}]});
        let urls = extract_image_urls(&data, &rules()).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://cdn.example.com/a/01.jpg",
                "http://plain.example.com/02.jpg",
                "https://cdn.example.com/03.jpg",
            ]
        );
    }

    #[test]
    fn protocol_relative_fragment_is_preserved_byte_for_byte() {
        let fragment = "//img.example.com/ch%201/ñ_01.jpg?x=1&y=2";
        let out = normalize_fragment(fragment);
        assert_eq!(out.strip_prefix("https:"), Some(fragment));
    }

    #[test]
    fn token_table_wins_over_sources() {
        let data = json!({
            "V": "8://7.6/k.j",
            "4": [{"3": ["x"]}],
            "sources": [{"images": ["//other/1.jpg"]}]
        });
        let urls = extract_image_urls(&data, &rules()).unwrap();
        assert_eq!(urls, vec!["https://mangatv.net/x.jpg"]);
    }

    #[test]
    fn unknown_shapes_are_rejected() {
        for data in [json!({"foo": 1}), json!({"sources": []}), json!([1, 2])] {
            assert!(
                matches!(
                    extract_image_urls(&data, &rules()),
                    Err(ResolutionError::UnrecognizedSchema(_))
                ),
                "{data}"
            );
        }
    }

    #[test]
    fn rules_are_configurable() {
        let custom = TokenTableRules {
            placeholder: "@".to_string(),
            host_marker: "HOST".to_string(),
            host_replacement: "img.example.org".to_string(),
            token_path: vec!["pages".to_string()],
            ..TokenTableRules::default()
        };
        let data = json!({"n": "8://HOST/@.j", "pages": ["p1=="]});
        assert_eq!(
            extract_image_urls(&data, &custom).unwrap(),
            vec!["https://img.example.org/p1.jpg"]
        );
    }

    #[test]
    fn validation_rejects_empty_placeholder() {
        let bad = TokenTableRules {
            placeholder: String::new(),
            ..TokenTableRules::default()
        };
        assert!(bad.validate().is_err());
        assert!(TokenTableRules::default().validate().is_ok());
    }
}
