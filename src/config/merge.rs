//! Layered config merging and environment overrides.

use super::schema::{Config, ConfigLayer, LogFormat, OrphanSlotPolicy};

/// Apply layers onto the defaults, least specific first.
pub fn merge_layers(layers: &[ConfigLayer]) -> Config {
    let mut config = Config::default();
    for layer in layers {
        layer.apply_to(&mut config);
    }
    config
}

/// Fold `WEFT_*` environment variables into a layer.
pub fn apply_env_overrides(layer: &mut ConfigLayer) {
    apply_env_overrides_from(layer, |name| std::env::var(name).ok());
}

fn apply_env_overrides_from(
    layer: &mut ConfigLayer,
    get: impl Fn(&str) -> Option<String>,
) {
    if let Some(filter) = get("WEFT_LOG") {
        layer.logging.filter = Some(filter);
    }
    if let Some(format) = get("WEFT_LOG_FORMAT") {
        layer.logging.stdout_format = match format.as_str() {
            "pretty" => Some(LogFormat::Pretty),
            "compact" => Some(LogFormat::Compact),
            "json" => Some(LogFormat::Json),
            other => {
                tracing::warn!(format = other, "unknown WEFT_LOG_FORMAT ignored");
                None
            }
        };
    }
    if let Some(policy) = get("WEFT_STRICT_SLOTS") {
        layer.recipes.orphan_slots = match policy.as_str() {
            "1" | "true" | "strict" => Some(OrphanSlotPolicy::Strict),
            "0" | "false" | "lenient" => Some(OrphanSlotPolicy::Lenient),
            other => {
                tracing::warn!(policy = other, "unknown WEFT_STRICT_SLOTS ignored");
                None
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layers_apply_in_order() {
        let lower = ConfigLayer {
            logging: super::super::schema::LoggingConfigOverride {
                stdout: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };
        let upper = ConfigLayer {
            logging: super::super::schema::LoggingConfigOverride {
                stdout: Some(true),
                filter: Some("weft=debug".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let config = merge_layers(&[lower, upper]);
        assert!(config.logging.stdout);
        assert_eq!(config.logging.filter.as_deref(), Some("weft=debug"));
    }

    #[test]
    fn env_overrides_parse_known_values() {
        let mut layer = ConfigLayer::default();
        apply_env_overrides_from(&mut layer, |name| match name {
            "WEFT_STRICT_SLOTS" => Some("strict".to_string()),
            "WEFT_LOG_FORMAT" => Some("json".to_string()),
            _ => None,
        });
        assert_eq!(layer.recipes.orphan_slots, Some(OrphanSlotPolicy::Strict));
        assert!(matches!(
            layer.logging.stdout_format,
            Some(LogFormat::Json)
        ));
    }
}
