//! Configuration for embedding hosts.
//!
//! Builder-first, with environment overrides layered on top via
//! [`ConfigBuilder::from_env`]. Stripe material comes from the conventional
//! `STRIPE_*` variables; everything else is prefixed `TOLLGATE_`. Secrets are
//! held as [`SecretString`], so a derived `Debug` never prints them.

use std::net::SocketAddr;

use secrecy::{ExposeSecret, SecretString};

use crate::checkout::CheckoutConfig;
use crate::error::{Result, TollgateError};
use crate::plans::PlanCatalog;

/// Main configuration for a tollgate deployment.
#[derive(Debug, Clone)]
pub struct TollgateConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub stripe: StripeConfig,
    pub checkout: CheckoutUrls,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

/// Stripe credentials and the four-price catalog grid.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Secret API key (`sk_*` or `rk_*`).
    pub secret_key: SecretString,
    /// Webhook signing secret (`whsec_*`).
    pub webhook_secret: SecretString,
    pub price_personal_monthly: String,
    pub price_personal_annual: String,
    pub price_enterprise_monthly: String,
    pub price_enterprise_annual: String,
    /// Whether enterprise checkouts may carry a trial period.
    pub enterprise_trial_eligible: bool,
    /// API base URL. Overridable for tests pointed at a local stub.
    pub api_base: String,
}

/// Redirect targets for the hosted checkout page.
#[derive(Debug, Clone)]
pub struct CheckoutUrls {
    pub success_url: String,
    pub cancel_url: String,
    pub allow_promotion_codes: bool,
    /// Allowed domains for the redirect URLs (empty = any HTTPS URL).
    pub allowed_redirect_domains: Vec<String>,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            stripe: StripeConfig::default(),
            checkout: CheckoutUrls::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            secret_key: SecretString::from(String::new()),
            webhook_secret: SecretString::from(String::new()),
            price_personal_monthly: String::new(),
            price_personal_annual: String::new(),
            price_enterprise_monthly: String::new(),
            price_enterprise_annual: String::new(),
            enterprise_trial_eligible: true,
            api_base: default_stripe_api_base(),
        }
    }
}

impl Default for CheckoutUrls {
    fn default() -> Self {
        Self {
            success_url: String::new(),
            cancel_url: String::new(),
            allow_promotion_codes: true,
            allowed_redirect_domains: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stripe_api_base() -> String {
    "https://api.stripe.com".to_string()
}

impl ServerConfig {
    pub fn addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

impl TollgateConfig {
    /// The plan catalog described by the Stripe section.
    pub fn catalog(&self) -> Result<PlanCatalog> {
        PlanCatalog::from_config(&self.stripe)
    }

    /// The checkout configuration described by the URLs section.
    #[must_use]
    pub fn checkout_config(&self) -> CheckoutConfig {
        CheckoutConfig::new(&self.checkout.success_url, &self.checkout.cancel_url)
            .allow_promotion_codes(self.checkout.allow_promotion_codes)
            .allowed_redirect_domains(self.checkout.allowed_redirect_domains.clone())
    }
}

/// Builder for [`TollgateConfig`] with environment variable support.
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: TollgateConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TollgateConfig::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.server.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_stripe_secret_key(mut self, key: impl Into<SecretString>) -> Self {
        self.config.stripe.secret_key = key.into();
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<SecretString>) -> Self {
        self.config.stripe.webhook_secret = secret.into();
        self
    }

    pub fn with_personal_prices(
        mut self,
        monthly: impl Into<String>,
        annual: impl Into<String>,
    ) -> Self {
        self.config.stripe.price_personal_monthly = monthly.into();
        self.config.stripe.price_personal_annual = annual.into();
        self
    }

    pub fn with_enterprise_prices(
        mut self,
        monthly: impl Into<String>,
        annual: impl Into<String>,
    ) -> Self {
        self.config.stripe.price_enterprise_monthly = monthly.into();
        self.config.stripe.price_enterprise_annual = annual.into();
        self
    }

    pub fn with_enterprise_trial(mut self, eligible: bool) -> Self {
        self.config.stripe.enterprise_trial_eligible = eligible;
        self
    }

    pub fn with_stripe_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.config.stripe.api_base = api_base.into();
        self
    }

    pub fn with_checkout_urls(
        mut self,
        success_url: impl Into<String>,
        cancel_url: impl Into<String>,
    ) -> Self {
        self.config.checkout.success_url = success_url.into();
        self.config.checkout.cancel_url = cancel_url.into();
        self
    }

    pub fn with_promotion_codes(mut self, allow: bool) -> Self {
        self.config.checkout.allow_promotion_codes = allow;
        self
    }

    pub fn with_allowed_redirect_domains<I, D>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        self.config.checkout.allowed_redirect_domains =
            domains.into_iter().map(Into::into).collect();
        self
    }

    /// Load configuration from environment variables.
    ///
    /// `TOLLGATE_*` for server, logging and checkout settings; the
    /// conventional `STRIPE_*` names for credentials and prices. `PORT` alone
    /// is honoured as a fallback for platform deploys.
    pub fn from_env(mut self) -> Self {
        if let Some(host) = env_with_prefix("HOST") {
            self.config.server.host = host;
        }
        if let Some(port) = env_with_prefix("PORT").or_else(|| env_var("PORT")) {
            if let Ok(parsed) = port.parse() {
                self.config.server.port = parsed;
            }
        }
        if let Some(level) = env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        if let Some(key) = env_var("STRIPE_SECRET_KEY") {
            self.config.stripe.secret_key = SecretString::from(key);
        }
        if let Some(secret) = env_var("STRIPE_WEBHOOK_SECRET") {
            self.config.stripe.webhook_secret = SecretString::from(secret);
        }
        if let Some(price) = env_var("STRIPE_PRICE_PERSONAL_MONTHLY") {
            self.config.stripe.price_personal_monthly = price;
        }
        if let Some(price) = env_var("STRIPE_PRICE_PERSONAL_ANNUAL") {
            self.config.stripe.price_personal_annual = price;
        }
        if let Some(price) = env_var("STRIPE_PRICE_ENTERPRISE_MONTHLY") {
            self.config.stripe.price_enterprise_monthly = price;
        }
        if let Some(price) = env_var("STRIPE_PRICE_ENTERPRISE_ANNUAL") {
            self.config.stripe.price_enterprise_annual = price;
        }
        if let Some(flag) = env_var("STRIPE_ENTERPRISE_TRIAL_ELIGIBLE") {
            self.config.stripe.enterprise_trial_eligible = flag.parse().unwrap_or(true);
        }
        if let Some(base) = env_var("STRIPE_API_BASE") {
            self.config.stripe.api_base = base;
        }

        if let Some(url) = env_with_prefix("CHECKOUT_SUCCESS_URL") {
            self.config.checkout.success_url = url;
        }
        if let Some(url) = env_with_prefix("CHECKOUT_CANCEL_URL") {
            self.config.checkout.cancel_url = url;
        }
        if let Some(domains) = env_with_prefix("ALLOWED_REDIRECT_DOMAINS") {
            self.config.checkout.allowed_redirect_domains = domains
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect();
        }

        self
    }

    /// Build the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the server address does not parse, or the port is 0
    /// - the log level is not one of trace/debug/info/warn/error
    /// - a Stripe secret is missing, or the price grid is incomplete
    /// - a checkout URL is missing, non-HTTPS, or off the domain allowlist
    pub fn build(self) -> Result<TollgateConfig> {
        self.config.server.addr().map_err(|e| {
            TollgateError::bad_request(format!(
                "Invalid server address {}:{} - {}",
                self.config.server.host, self.config.server.port, e
            ))
        })?;
        if self.config.server.port == 0 {
            return Err(TollgateError::bad_request(
                "Server port must be greater than 0",
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(TollgateError::bad_request(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if self.config.stripe.secret_key.expose_secret().is_empty() {
            return Err(TollgateError::bad_request(
                "Stripe secret key is required (STRIPE_SECRET_KEY)",
            ));
        }
        if self.config.stripe.webhook_secret.expose_secret().is_empty() {
            return Err(TollgateError::bad_request(
                "Stripe webhook secret is required (STRIPE_WEBHOOK_SECRET)",
            ));
        }

        // Delegates price-grid completeness and duplicate detection.
        self.config.catalog()?;

        // Delegates URL parsing, the HTTPS requirement and the allowlist.
        self.config.checkout_config().validate()?;

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn env_with_prefix(key: &str) -> Option<String> {
    env_var(&format!("TOLLGATE_{key}"))
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> ConfigBuilder {
        ConfigBuilder::new()
            .with_stripe_secret_key("sk_test_12345678901234567890")
            .with_webhook_secret("whsec_test")
            .with_personal_prices("price_pm", "price_pa")
            .with_enterprise_prices("price_em", "price_ea")
            .with_checkout_urls(
                "https://app.example.com/success",
                "https://app.example.com/cancel",
            )
    }

    #[test]
    fn defaults_bind_all_interfaces() {
        let config = TollgateConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.stripe.api_base, "https://api.stripe.com");
    }

    #[test]
    fn a_complete_builder_chain_validates() {
        let config = complete()
            .with_host("127.0.0.1")
            .with_port(9000)
            .with_log_level("debug")
            .with_enterprise_trial(false)
            .build()
            .unwrap();

        assert_eq!(config.server.port, 9000);
        assert!(!config.stripe.enterprise_trial_eligible);

        let catalog = config.catalog().unwrap();
        assert_eq!(
            catalog.price_id(
                crate::account::PlanTier::Personal,
                crate::account::BillingInterval::Annual
            ),
            "price_pa"
        );
    }

    #[test]
    fn build_requires_stripe_secrets() {
        let err = complete()
            .with_stripe_secret_key("")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("secret key"));

        let err = complete().with_webhook_secret("").build().unwrap_err();
        assert!(err.to_string().contains("webhook secret"));
    }

    #[test]
    fn build_rejects_an_incomplete_price_grid() {
        let err = ConfigBuilder::new()
            .with_stripe_secret_key("sk_test_12345678901234567890")
            .with_webhook_secret("whsec_test")
            .with_personal_prices("price_pm", "price_pa")
            .with_checkout_urls(
                "https://app.example.com/success",
                "https://app.example.com/cancel",
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("enterprise"));
    }

    #[test]
    fn build_rejects_plain_http_redirects() {
        let err = complete()
            .with_checkout_urls("http://app.example.com/s", "https://app.example.com/c")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("HTTPS"));
    }

    #[test]
    fn build_rejects_a_zero_port() {
        let err = complete().with_port(0).build().unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn build_rejects_a_bogus_log_level() {
        let err = complete().with_log_level("verbose").build().unwrap_err();
        assert!(err.to_string().contains("log level"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = complete().build().unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk_test_12345678901234567890"));
        assert!(!debug.contains("whsec_test"));
    }

    #[test]
    fn redirect_domain_allowlist_is_enforced() {
        let err = complete()
            .with_allowed_redirect_domains(["other.example.net"])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("not allowed"));

        complete()
            .with_allowed_redirect_domains(["example.com"])
            .build()
            .unwrap();
    }
}
