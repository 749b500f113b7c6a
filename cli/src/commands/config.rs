use anyhow::Result;
use visionweaver_core::WeaverConfig;

const MASK: &str = "********";

pub fn execute(config: &WeaverConfig) -> Result<()> {
    println!("{}", render(config)?);
    Ok(())
}

/// Effective configuration as TOML with secrets masked.
fn render(config: &WeaverConfig) -> Result<String> {
    let mut shown = config.clone();
    if shown.llm.api_key.is_some() {
        shown.llm.api_key = Some(MASK.to_string());
    }
    if shown.image.api_key.is_some() {
        shown.image.api_key = Some(MASK.to_string());
    }
    Ok(toml::to_string_pretty(&shown)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_keys_are_masked() {
        let mut config = WeaverConfig::default();
        config.llm.api_key = Some("sk-secret".to_string());

        let rendered = render(&config).unwrap();
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains(MASK));
        assert!(rendered.contains("[gate]"));
    }
}
