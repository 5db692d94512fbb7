/// Pull the first JSON object or array out of a model reply.
///
/// Models routinely wrap JSON in code fences or prefix it with prose; this
/// finds the outermost balanced `{...}` or `[...]` and returns that slice.
pub fn extract_json_payload(response: &str) -> Option<&str> {
    let trimmed = response.trim();

    // Strip a ```json ... ``` fence if the whole reply is one.
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    for (open, close) in [('{', '}'), ('[', ']')] {
        let start = match inner.find(open) {
            Some(idx) => idx,
            None => continue,
        };

        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, ch) in inner[start..].char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                c if c == open && !in_string => depth += 1,
                c if c == close && !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&inner[start..start + offset + ch.len_utf8()]);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::extract_json_payload;

    #[test]
    fn extracts_plain_object() {
        assert_eq!(
            extract_json_payload(r#"{"a": 1}"#),
            Some(r#"{"a": 1}"#)
        );
    }

    #[test]
    fn extracts_from_code_fence_with_prose() {
        let reply = "好的，结果如下：\n```json\n{\"memories\": []}\n```";
        assert_eq!(extract_json_payload(reply), Some(r#"{"memories": []}"#));
    }

    #[test]
    fn handles_braces_inside_strings() {
        let reply = r#"前缀 {"text": "包含 } 的字符串", "n": 2} 后缀"#;
        assert_eq!(
            extract_json_payload(reply),
            Some(r#"{"text": "包含 } 的字符串", "n": 2}"#)
        );
    }

    #[test]
    fn returns_none_without_json() {
        assert_eq!(extract_json_payload("没有结构化内容"), None);
    }
}
