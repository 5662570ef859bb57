//! Tests for configuration

#[cfg(test)]
mod tests {
    use super::super::config::*;
    use crate::ensemble::OptimizationMethod;
    use crate::error::ForecastError;
    use crate::model::ModelKind;
    use std::io::Write;

    #[test]
    fn test_ensemble_config_default() {
        let config = EnsembleConfig::default();
        assert_eq!(config.enabled_models.len(), 6);
        assert_eq!(config.optimization_window, 100);
        assert_eq!(config.optimization_method, OptimizationMethod::Nnls);
        assert!(!config.regime_aware);
        assert_eq!(config.calibration_key, "ensemble");
    }

    #[test]
    fn test_uncertainty_config_default() {
        let config = UncertaintyConfig::default();
        assert_eq!(config.confidence_level, 0.95);
        assert_eq!(config.min_samples_for_calibration, 30);
        assert_eq!(config.min_calibration_ratio, 0.1);
    }

    #[test]
    fn test_monitor_config_defaults() {
        let config: MonitorConfig = toml::from_str("").unwrap();
        assert_eq!(config.accuracy_window, 50);
        assert_eq!(config.min_samples_for_alert, 20);
        assert_eq!(config.low_accuracy_threshold, 0.45);
        assert_eq!(config.model_degradation_threshold, 0.40);
        assert_eq!(config.accuracy_drop_threshold, 0.15);
        assert_eq!(config.alert_cooldown_secs, 3600);
    }

    #[test]
    fn test_walk_forward_partial_override() {
        let toml_str = r#"
train_days = 60
step_days = 10
"#;
        let config: WalkForwardConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.train_days, 60);
        assert_eq!(config.step_days, 10);
        assert_eq!(config.val_days, 30);
        assert_eq!(config.n_folds, 3);
        assert_eq!(config.divergence_threshold, 0.20);
    }

    #[test]
    fn test_full_config_from_toml() {
        let toml_str = r#"
[ensemble]
enabled_models = ["baseline", "lstm"]
optimization_method = "inverse_error"
regime_aware = true

[monitor]
alert_cooldown_secs = 600

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.ensemble.enabled_models,
            vec![ModelKind::Baseline, ModelKind::Lstm]
        );
        assert_eq!(config.ensemble.optimization_method, OptimizationMethod::InverseError);
        assert!(config.ensemble.regime_aware);
        assert_eq!(config.monitor.alert_cooldown_secs, 600);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.health.health_window, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[walk_forward]\ntrain_days = 90\n\n[uncertainty]\nconfidence_level = 0.9").unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.walk_forward.train_days, 90);
        assert_eq!(config.uncertainty.confidence_level, 0.9);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.ensemble.optimization_window, 100);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[uncertainty]\nconfidence_level = 1.5").unwrap();

        let err = Config::load(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ForecastError::Configuration(_)));
    }

    #[test]
    fn test_validate_rejections() {
        let mut config = Config::default();
        config.walk_forward.val_days = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ensemble.optimization_window = 5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.monitor.alert_cooldown_secs = -1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.health.marginal_threshold = 0.9;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.uncertainty.min_calibration_ratio = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_snapshot() {
        let json = Config::default().to_json().unwrap();
        assert_eq!(json["ensemble"]["optimization_method"], "nnls");
        assert_eq!(json["monitor"]["max_alerts"], 1000);
        assert_eq!(json["regime"]["adx_period"], 14);
    }
}
