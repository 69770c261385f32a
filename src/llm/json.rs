//! LLM 输出的宽松 JSON 提取
//!
//! 模型经常把 JSON 包进 markdown 代码块、夹带前后缀文字或用单引号。
//! 提取顺序：剥 ``` 围栏 -> 取最外层 {...} -> 直接解析，失败后把单引号
//! 替换为双引号再试一次。

use serde::de::DeserializeOwned;

/// 从原始模型输出中提取并反序列化一个 JSON 对象
pub fn parse_loose<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    let candidate = extract_json_object(raw);
    match serde_json::from_str::<T>(&candidate) {
        Ok(v) => Ok(v),
        Err(first_err) => {
            // 单引号 JSON 的最后一搏
            let requoted = candidate.replace('\'', "\"");
            serde_json::from_str::<T>(&requoted).map_err(|_| first_err.to_string())
        }
    }
}

/// 定位输出里最可能是 JSON 对象的片段
fn extract_json_object(raw: &str) -> String {
    let mut text = raw.trim();

    // 剥掉 ```json ... ``` 围栏
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            text = after[..end].trim();
        }
    }

    // 取第一个 '{' 到配对的 '}' 之间的内容
    if let Some(open) = text.find('{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, c) in text[open..].char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                '{' if !in_string => depth += 1,
                '}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        return text[open..open + i + 1].to_string();
                    }
                }
                _ => {}
            }
        }
    }

    text.to_string()
}
