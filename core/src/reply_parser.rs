//! Tolerant parsing of free-form language-model replies.
//!
//! Model output is treated as untrusted text: every extractor here has an
//! explicit fallback and never fails. Malformed assessment replies resolve to
//! "image required", malformed placement replies resolve to the default
//! bottom-right / 20% placement.

use crate::config::Locale;
use crate::state::{OverlayPosition, Placement};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n?(.*?)```").unwrap());

static LABELED_POSITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?:位置|\bposition|\bplacement)[*`"'\s]*[：:=]?[*`"'\s]*(top[_ -]?left|top[_ -]?right|bottom[_ -]?left|bottom[_ -]?right|center|centre)"#,
    )
    .unwrap()
});

static BARE_POSITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(top[_-]left|top[_-]right|bottom[_-]left|bottom[_-]right)\b|(左上角|右上角|左下角|右下角|正中间|居中)")
        .unwrap()
});

static LABELED_SIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?:大小(?:比例)?|尺寸(?:比例)?|\bsize(?:[_ ]?ratio)?|\bscale)[*`"'\s]*[：:=]?[*`"'\s]*(\d+(?:\.\d+)?)\s*%"#,
    )
    .unwrap()
});

static OVERLAY_INSTRUCTIONS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(添加|放置|合成|插入).*?(二维码|logo|标志|图片|图像)",
        r"(?i)(右下角|左下角|右上角|左上角).*?(二维码|logo|标志)",
        r"(?i)(把|将).*?(二维码|logo|标志).*?(放|添加|合成|插入)",
        r"(?i)\b(?:add|place|put|insert|overlay|paste|composite|stamp)\b[^.,;!?\n]*?\b(?:qr[ -]?codes?|logos?|watermarks?)\b(?:\s+(?:in|at|on|to|onto)\s+(?:the\s+)?(?:(?:top|bottom|upper|lower)[ -]?)?(?:(?:left|right)[ -]?)?(?:corner|center|centre|side)?)?",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

static DANGLING_CONNECTOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:[\s,，;；、]+(?:and|then|并且|并|然后|再)?)+$").unwrap());

static REPEATED_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}").unwrap());

/// Outcome of the intent-classification call.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub requires_image: bool,
    pub explanation: String,
    /// Direct answer for requests that need no image
    pub response: String,
    /// False when the reply could not be parsed and the fallback was used
    pub parsed: bool,
}

impl Assessment {
    /// Decision used whenever the reply is unusable: do the work rather than refuse.
    pub fn fallback() -> Self {
        Self {
            requires_image: true,
            explanation: "assessment reply could not be parsed; assuming an image is required"
                .to_string(),
            response: String::new(),
            parsed: false,
        }
    }
}

/// Parse the assessment reply of the language model.
pub fn parse_assessment(reply: &str) -> Assessment {
    let Some(object) = extract_json_object(reply) else {
        return Assessment::fallback();
    };

    let requires_image = ["requires_image", "requiresImage", "needs_image", "image_required"]
        .iter()
        .find_map(|key| object.get(*key))
        .and_then(value_as_bool)
        .unwrap_or(true);

    Assessment {
        requires_image,
        explanation: string_field(&object, &["explanation", "reason"]),
        response: string_field(&object, &["response", "answer", "reply"]),
        parsed: true,
    }
}

/// Find the first JSON object in a reply.
///
/// Fenced blocks are tried first, then every balanced `{...}` substring in order.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    for captures in FENCED_BLOCK.captures_iter(text) {
        if let Some(object) = captures.get(1).and_then(|m| parse_object(m.as_str())) {
            return Some(object);
        }
    }

    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(len) = balanced_object_len(&text[start..]) {
            if let Some(object) = parse_object(&text[start..start + len]) {
                return Some(object);
            }
        }
        search_from = start + 1;
    }

    None
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

/// Byte length of the balanced object starting at `text[0] == '{'`.
fn balanced_object_len(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(index + 1);
                }
            }
            _ => {}
        }
    }

    None
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "是" => Some(true),
            "false" | "no" | "0" | "否" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Extract overlay placement from a composition-advice reply.
pub fn parse_placement(reply: &str) -> Placement {
    let default = Placement::default();

    let position = LABELED_POSITION
        .captures(reply)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().to_lowercase().replace("centre", "center").parse().ok())
        .or_else(|| {
            BARE_POSITION
                .captures(reply)
                .and_then(|c| c.get(0))
                .and_then(|m| position_from_phrase(m.as_str()))
        })
        .unwrap_or(default.position);

    let size_ratio = LABELED_SIZE
        .captures(reply)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|percent| percent / 100.0)
        .filter(|ratio| *ratio > 0.0 && *ratio <= 1.0)
        .unwrap_or(default.size_ratio);

    Placement {
        position,
        size_ratio,
    }
}

fn position_from_phrase(phrase: &str) -> Option<OverlayPosition> {
    match phrase {
        "左上角" => Some(OverlayPosition::TopLeft),
        "右上角" => Some(OverlayPosition::TopRight),
        "左下角" => Some(OverlayPosition::BottomLeft),
        "右下角" => Some(OverlayPosition::BottomRight),
        "正中间" | "居中" => Some(OverlayPosition::Center),
        other => other.parse().ok(),
    }
}

/// Remove overlay/compositing instructions so they don't reach the image backend.
pub fn strip_overlay_instructions(text: &str) -> String {
    let mut filtered = text.to_string();
    for pattern in OVERLAY_INSTRUCTIONS.iter() {
        filtered = pattern.replace_all(&filtered, "").into_owned();
    }
    let filtered = REPEATED_SPACE.replace_all(&filtered, " ");
    let filtered = DANGLING_CONNECTOR.replace(filtered.trim(), "");
    filtered.trim().to_string()
}

/// Counts of (ASCII letters, CJK ideographs) in a text.
pub fn script_counts(text: &str) -> (usize, usize) {
    text.chars().fold((0, 0), |(latin, cjk), ch| {
        if ch.is_ascii_alphabetic() {
            (latin + 1, cjk)
        } else if ('\u{4e00}'..='\u{9fa5}').contains(&ch) {
            (latin, cjk + 1)
        } else {
            (latin, cjk)
        }
    })
}

/// Whether a reply appears to be written in a different language than requested.
pub fn is_language_drift(text: &str, locale: Locale) -> bool {
    let (latin, cjk) = script_counts(text);
    match locale {
        Locale::Zh => latin > cjk,
        Locale::En => cjk > latin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_assessment() {
        let reply = "Sure.\n```json\n{\"requires_image\": false, \"explanation\": \"question\", \"response\": \"It is a kind of computing.\"}\n```";
        let assessment = parse_assessment(reply);
        assert!(assessment.parsed);
        assert!(!assessment.requires_image);
        assert_eq!(assessment.response, "It is a kind of computing.");
    }

    #[test]
    fn test_camel_case_alias() {
        let assessment = parse_assessment(r#"{"requiresImage": false, "response": "Hi"}"#);
        assert!(!assessment.requires_image);
        assert_eq!(assessment.response, "Hi");
    }

    #[test]
    fn test_bare_object_with_braces_in_strings() {
        let reply = r#"I think {"requires_image": "false", "response": "use {braces} freely"} is right"#;
        let assessment = parse_assessment(reply);
        assert!(assessment.parsed);
        assert!(!assessment.requires_image);
        assert_eq!(assessment.response, "use {braces} freely");
    }

    #[test]
    fn test_skips_unparseable_candidates() {
        let reply = r#"{not json} and then {"requires_image": true}"#;
        let assessment = parse_assessment(reply);
        assert!(assessment.parsed);
        assert!(assessment.requires_image);
    }

    #[test]
    fn test_malformed_reply_falls_back_to_image_required() {
        let reply = "I would say { requires_image: nope";
        let first = parse_assessment(reply);
        let second = parse_assessment(reply);
        assert_eq!(first, second);
        assert!(first.requires_image);
        assert!(!first.parsed);
    }

    #[test]
    fn test_missing_flag_defaults_to_required() {
        let assessment = parse_assessment(r#"{"explanation": "unclear"}"#);
        assert!(assessment.parsed);
        assert!(assessment.requires_image);
    }

    #[test]
    fn test_labeled_placement() {
        let placement = parse_placement("建议方案：\n位置: top_left\n大小比例: 15%\n透明度: 100%");
        assert_eq!(placement.position, OverlayPosition::TopLeft);
        assert!((placement.size_ratio - 0.15).abs() < f64::EPSILON);

        let placement = parse_placement("**Position**: Bottom-Left, **size ratio**: 30 %");
        assert_eq!(placement.position, OverlayPosition::BottomLeft);
        assert!((placement.size_ratio - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_unlabeled_placement_phrases() {
        assert_eq!(
            parse_placement("把二维码放在右上角比较好").position,
            OverlayPosition::TopRight
        );
        assert_eq!(
            parse_placement("I'd go with top-right here.").position,
            OverlayPosition::TopRight
        );
    }

    #[test]
    fn test_placement_defaults() {
        let placement = parse_placement("no idea, do whatever looks nice");
        assert_eq!(placement, Placement::default());

        let oversized = parse_placement("position: center, size: 250%");
        assert_eq!(oversized.position, OverlayPosition::Center);
        assert!((oversized.size_ratio - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_strip_english_overlay_instructions() {
        let filtered =
            strip_overlay_instructions("Generate a cute cartoon cat and place the logo in the bottom right corner");
        assert_eq!(filtered, "Generate a cute cartoon cat");

        let filtered = strip_overlay_instructions("A summer poster, add a QR code. Bright colors.");
        assert!(!filtered.to_lowercase().contains("qr"));
        assert!(filtered.contains("Bright colors"));
    }

    #[test]
    fn test_strip_chinese_overlay_instructions() {
        let filtered = strip_overlay_instructions("生成一张中秋节海报，在右下角添加二维码");
        assert!(!filtered.contains("二维码"));
        assert!(filtered.starts_with("生成一张中秋节海报"));

        let filtered = strip_overlay_instructions("把logo放到左上角，画一只熊猫");
        assert!(!filtered.to_lowercase().contains("logo"));
        assert!(filtered.contains("熊猫"));
    }

    #[test]
    fn test_strip_leaves_plain_prompts_alone() {
        assert_eq!(
            strip_overlay_instructions("A watercolor lighthouse at dusk"),
            "A watercolor lighthouse at dusk"
        );
    }

    #[test]
    fn test_language_drift() {
        assert!(is_language_drift("Your image is ready!", Locale::Zh));
        assert!(!is_language_drift("您的图片已经生成，请查看。", Locale::Zh));
        assert!(is_language_drift("您的图片已经生成，请查看。", Locale::En));
        assert!(!is_language_drift("Your image is ready!", Locale::En));
        assert_eq!(script_counts("ab猫"), (2, 1));
    }
}
