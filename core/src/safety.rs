//! Pre-execution content filter.
//!
//! The [`SafetyGate`] runs before the execution gate and rejects requests whose
//! prompt trips the configured [`ContentFilter`]. It is stateless and never
//! blocks.

use crate::config::SafetyConfig;
use crate::errors::{GateError, GateResult, WeaverError, WeaverResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a content check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked { reason: String },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Pluggable text classifier.
pub trait ContentFilter: Send + Sync {
    fn check(&self, text: &str) -> Verdict;
}

const VIOLENCE: &[&str] = &[
    "暴力", "杀人", "杀害", "残害", "虐待", "恐吓", "爆炸", "炸弹", "枪支", "屠杀", "血腥",
    "砍杀", "袭击", "轰炸", "恐怖袭击", "bomb", "explosive", "massacre", "murder", "terrorist",
];

const ILLEGAL: &[&str] = &[
    "毒品", "冰毒", "海洛因", "摇头丸", "违禁品", "走私", "贩毒", "制毒", "吸毒", "盗窃",
    "抢劫", "诈骗", "洗钱", "绑架", "勒索", "cocaine", "heroin", "meth", "smuggling",
    "money laundering",
];

const ADULT: &[&str] = &[
    "色情", "淫秽", "裸露", "性爱", "性虐待", "援交", "卖淫", "嫖娼", "性交易", "裸聊",
    "偷拍", "porn", "pornography", "nsfw", "explicit sex",
];

const GAMBLING: &[&str] = &[
    "赌博", "博彩", "赌场", "赌钱", "老虎机", "赌球", "赌资", "gambling", "casino",
];

static SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\s\-_\.,:;!@#$%^&*()<>\[\]{}|~`+='"?]+"#).unwrap());

static DANGEROUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(如何|怎么|怎样).*(制造|制作|合成|购买|获取).*(炸弹|毒品|违禁品|武器)",
        r"(如何|怎么|怎样).*(偷窃|盗窃|抢劫|杀人|伤害|恐吓|侵犯|骗取|诈骗)",
        r"(色情|裸露|暴露|露出).*(儿童|未成年|小孩)",
        r"(自杀|轻生|结束生命).*(方法|办法|步骤|教程)",
        r"(贩卖|制作|购买|吸食).*(毒品|违禁药品|致幻剂)",
        r"(赌博|博彩).*(技巧|方法|窍门|平台)",
        r"(黑入|入侵|攻击).*(系统|网站|账号|设备)",
        r"\bhow\s+(?:to|do\s+i|can\s+i)\b.*\b(?:make|build|buy|get)\b.*\b(?:bombs?|explosives?|drugs?|weapons?)\b",
        r"\b(?:hack|break)\s+into\b.*\b(?:systems?|websites?|accounts?|devices?)\b",
        r"\b(?:nude|naked|sexual)\b.*\b(?:child|children|minors?|kids?)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// One prohibited term with its precompiled matchers.
#[derive(Debug)]
struct WordRule {
    word: String,
    /// Word-boundary matcher for Latin terms; CJK terms use substring search
    exact: Option<Regex>,
    /// Matches the term with separators between its characters
    spaced: Option<Regex>,
}

impl WordRule {
    fn new(word: String) -> Option<Self> {
        let latin = word.is_ascii();
        let exact = if latin {
            Some(Regex::new(&format!(r"\b{}\b", regex::escape(&word))).ok()?)
        } else {
            None
        };

        let chars: Vec<char> = word.chars().filter(|c| !c.is_whitespace()).collect();
        let spaced = if chars.len() > 1 {
            let body = chars
                .iter()
                .map(|c| regex::escape(&c.to_string()))
                .collect::<Vec<_>>()
                .join(r"[\s\W_]*");
            let pattern = if latin {
                format!(r"(?i)\b{}\b", body)
            } else {
                format!("(?i){}", body)
            };
            Regex::new(&pattern).ok()
        } else {
            None
        };

        Some(Self {
            word,
            exact,
            spaced,
        })
    }

    fn found_in(&self, lowered: &str) -> bool {
        match &self.exact {
            Some(re) => re.is_match(lowered),
            None => lowered.contains(&self.word),
        }
    }
}

/// Lexicon filter with separator-evasion checks and dangerous-intent patterns.
#[derive(Debug)]
pub struct KeywordFilter {
    rules: Vec<WordRule>,
}

impl Default for KeywordFilter {
    fn default() -> Self {
        Self::new(Self::default_words())
    }
}

impl KeywordFilter {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: BTreeSet<String> = words
            .into_iter()
            .map(|w| w.into().trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();

        Self {
            rules: words.into_iter().filter_map(WordRule::new).collect(),
        }
    }

    /// The built-in lexicon: violence, illegal activity, adult content and gambling.
    pub fn default_words() -> Vec<String> {
        [VIOLENCE, ILLEGAL, ADULT, GAMBLING]
            .iter()
            .flat_map(|category| category.iter().map(|w| w.to_string()))
            .collect()
    }

    /// Built-in lexicon plus the configured word file and extra words.
    pub fn from_config(config: &SafetyConfig) -> WeaverResult<Self> {
        let mut words = Self::default_words();
        if let Some(path) = &config.word_list {
            words.extend(Self::load_word_file(path)?);
        }
        words.extend(config.extra_words.iter().cloned());

        let filter = Self::new(words);
        info!("Content filter ready with {} terms", filter.len());
        Ok(filter)
    }

    /// Read one term per line; blank lines and `#` comments are skipped.
    pub fn load_word_file(path: &Path) -> WeaverResult<Vec<String>> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WeaverError::ConfigError(format!("Failed to read word list {:?}: {}", path, e))
        })?;

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl ContentFilter for KeywordFilter {
    fn check(&self, text: &str) -> Verdict {
        if text.trim().is_empty() {
            return Verdict::Allowed;
        }

        let lowered = text.to_lowercase();
        let cleaned = SEPARATORS.replace_all(&lowered, "");

        for rule in &self.rules {
            if rule.found_in(&lowered) {
                return Verdict::Blocked {
                    reason: format!("content contains a prohibited term: {}", rule.word),
                };
            }
        }

        for rule in self.rules.iter().filter(|r| r.exact.is_none()) {
            if cleaned.contains(&rule.word) {
                return Verdict::Blocked {
                    reason: format!("content contains a disguised prohibited term: {}", rule.word),
                };
            }
        }

        for rule in &self.rules {
            if rule.spaced.as_ref().is_some_and(|re| re.is_match(text)) {
                return Verdict::Blocked {
                    reason: format!("content contains a separated prohibited term: {}", rule.word),
                };
            }
        }

        for pattern in DANGEROUS_PATTERNS.iter() {
            if pattern.is_match(&lowered) || pattern.is_match(&cleaned) {
                return Verdict::Blocked {
                    reason: "content matches a dangerous request pattern".to_string(),
                };
            }
        }

        Verdict::Allowed
    }
}

/// Routes whose bodies carry a generation prompt.
pub const GUARDED_ROUTES: [&str; 2] = ["/generate", "/generate_with_image"];

/// Rejects unsafe prompts before any lease is taken.
#[derive(Clone)]
pub struct SafetyGate {
    filter: Option<Arc<dyn ContentFilter>>,
}

impl SafetyGate {
    pub fn new(filter: Arc<dyn ContentFilter>) -> Self {
        Self {
            filter: Some(filter),
        }
    }

    /// A gate that admits everything.
    pub fn disabled() -> Self {
        Self { filter: None }
    }

    pub fn from_config(config: &SafetyConfig) -> WeaverResult<Self> {
        if !config.enabled {
            warn!("Content filter disabled by configuration");
            return Ok(Self::disabled());
        }
        Ok(Self::new(Arc::new(KeywordFilter::from_config(config)?)))
    }

    pub fn is_enabled(&self) -> bool {
        self.filter.is_some()
    }

    /// Check a prompt.
    pub fn check(&self, prompt: &str) -> GateResult<()> {
        let Some(filter) = &self.filter else {
            return Ok(());
        };

        match filter.check(prompt) {
            Verdict::Allowed => Ok(()),
            Verdict::Blocked { reason } => {
                warn!(
                    prompt = %crate::state::preview(prompt, 50),
                    "Unsafe content rejected: {}",
                    reason
                );
                Err(GateError::Rejected { reason })
            }
        }
    }

    /// Check the prompt inside a request body sent to one of the guarded routes.
    ///
    /// JSON, form-encoded and multipart bodies are understood; other routes and
    /// bodies without a prompt pass.
    pub fn inspect_body(
        &self,
        path: &str,
        content_type: Option<&str>,
        body: &[u8],
    ) -> GateResult<()> {
        if !GUARDED_ROUTES.iter().any(|route| path.ends_with(route)) {
            return Ok(());
        }

        match extract_prompt(content_type, body) {
            Some(prompt) => self.check(&prompt),
            None => {
                debug!(path, "No prompt found in request body");
                Ok(())
            }
        }
    }
}

/// Pull the `prompt` field out of a request body.
pub fn extract_prompt(content_type: Option<&str>, body: &[u8]) -> Option<String> {
    let content_type = content_type.unwrap_or("").to_ascii_lowercase();

    if content_type.contains("multipart/form-data") {
        return multipart_field(body, "prompt");
    }
    if content_type.contains("application/x-www-form-urlencoded") {
        return form_field(body, "prompt");
    }

    json_field(body, "prompt").or_else(|| form_field(body, "prompt"))
}

fn json_field(body: &[u8], name: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get(name)?.as_str().map(str::to_string)
}

fn form_field(body: &[u8], name: &str) -> Option<String> {
    url::form_urlencoded::parse(body)
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn multipart_field(body: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let marker = format!("name=\"{}\"", name);
    let start = text.find(&marker)?;
    let rest = &text[start..];
    let content_start = rest.find("\r\n\r\n").map(|i| i + 4)?;
    let content = &rest[content_start..];
    let end = content.find("\r\n--").unwrap_or(content.len());
    Some(content[..end].to_string())
}
