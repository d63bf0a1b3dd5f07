//! Shopier hosted payment page and OSB callbacks.
//!
//! Shopier has no server-side session API: checkout is an HTML form the
//! buyer's browser posts to Shopier, signed with the merchant API secret.
//! Payment results arrive through OSB, a form POST carrying the merchant's
//! OSB credentials in `API_key`/`API_secret`.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use creditline_core::{AccountId, CreditPackage};

use crate::crypto::{constant_time_eq, hmac_sha256_base64};

/// Shopier merchant credentials and endpoints.
#[derive(Debug, Clone)]
pub struct ShopierGateway {
    api_key: String,
    api_secret: String,
    osb_username: Option<String>,
    osb_password: Option<String>,
    payment_url: String,
    callback_url: String,
}

/// A signed payment form, rendered by the frontend and posted to Shopier.
#[derive(Debug, Clone, Serialize)]
pub struct ShopierForm {
    /// Form action URL.
    pub action: String,
    /// Hidden form fields, including `signature`.
    pub fields: BTreeMap<String, String>,
}

/// OSB callback body.
#[derive(Debug, Clone, Deserialize)]
pub struct OsbNotification {
    /// OSB username.
    #[serde(rename = "API_key", default)]
    pub api_key: String,
    /// OSB password.
    #[serde(rename = "API_secret", default)]
    pub api_secret: String,
    /// Our merchant order id.
    pub platform_order_id: String,
    /// `success` or `failed`.
    #[serde(default)]
    pub status: String,
    /// `paid` when money was collected.
    #[serde(default)]
    pub payment_status: String,
    /// Buyer email as entered on the payment page.
    #[serde(default)]
    pub buyer_email: Option<String>,
    /// Total charged.
    #[serde(default)]
    pub total_order_price: Option<String>,
    /// Currency of the charge.
    #[serde(default)]
    pub currency: Option<String>,
}

impl OsbNotification {
    /// Whether the notification reports a collected payment.
    #[must_use]
    pub fn is_paid(&self) -> bool {
        self.status.eq_ignore_ascii_case("success") && self.payment_status.eq_ignore_ascii_case("paid")
    }

    /// Whether the notification reports a failed payment.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status.eq_ignore_ascii_case("failed")
    }
}

/// Shopier's numeric currency code.
fn currency_code(currency: &str) -> &'static str {
    match currency.to_ascii_lowercase().as_str() {
        "usd" => "1",
        "eur" => "2",
        _ => "0",
    }
}

/// Minor units as a decimal string, `24900 -> "249.00"`.
fn format_amount(minor: i64) -> String {
    format!("{}.{:02}", minor / 100, minor % 100)
}

/// Merchant order id for a new Shopier order.
#[must_use]
pub fn merchant_order_id(account_id: &AccountId, now_millis: i64) -> String {
    format!("ORD-{account_id}-{now_millis}")
}

impl ShopierGateway {
    /// Create a gateway.
    #[must_use]
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        payment_url: impl Into<String>,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            osb_username: None,
            osb_password: None,
            payment_url: payment_url.into(),
            callback_url: callback_url.into(),
        }
    }

    /// Set the OSB credentials expected in callbacks.
    #[must_use]
    pub fn with_osb_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.osb_username = username;
        self.osb_password = password;
        self
    }

    /// Whether OSB callbacks can be authenticated.
    #[must_use]
    pub const fn accepts_osb(&self) -> bool {
        self.osb_username.is_some() && self.osb_password.is_some()
    }

    /// Build the signed payment form for `package`.
    #[must_use]
    pub fn payment_form(
        &self,
        platform_order_id: &str,
        package: &CreditPackage,
        buyer_email: Option<&str>,
    ) -> ShopierForm {
        let random_nr = rand::thread_rng().gen_range(100_000..1_000_000).to_string();
        self.payment_form_with_nonce(platform_order_id, package, buyer_email, &random_nr)
    }

    fn payment_form_with_nonce(
        &self,
        platform_order_id: &str,
        package: &CreditPackage,
        buyer_email: Option<&str>,
        random_nr: &str,
    ) -> ShopierForm {
        let total = format_amount(package.price_minor);
        let currency = currency_code(&package.currency);
        let signature = hmac_sha256_base64(
            &self.api_secret,
            &format!("{random_nr}{platform_order_id}{total}{currency}"),
        );

        let fields: BTreeMap<String, String> = [
            ("API_key", self.api_key.clone()),
            ("website_index", "1".to_string()),
            ("platform_order_id", platform_order_id.to_string()),
            ("product_name", package.name.clone()),
            ("product_type", "1".to_string()),
            ("buyer_name", "Creditline".to_string()),
            ("buyer_surname", "Customer".to_string()),
            (
                "buyer_email",
                buyer_email.unwrap_or("no-email@example.com").to_string(),
            ),
            ("buyer_account_age", "0".to_string()),
            ("buyer_id_nr", "0".to_string()),
            ("buyer_phone", "05555555555".to_string()),
            ("billing_address", "Digital service".to_string()),
            ("billing_city", "Istanbul".to_string()),
            ("billing_country", "Turkey".to_string()),
            ("billing_postcode", "34000".to_string()),
            ("shipping_address", "Digital service".to_string()),
            ("shipping_city", "Istanbul".to_string()),
            ("shipping_country", "Turkey".to_string()),
            ("shipping_postcode", "34000".to_string()),
            ("total_order_value", total),
            ("currency", currency.to_string()),
            ("platform", "0".to_string()),
            ("is_in_frame", "0".to_string()),
            ("current_language", "0".to_string()),
            ("modul_version", "1.0.4".to_string()),
            ("random_nr", random_nr.to_string()),
            ("callback_url", self.callback_url.clone()),
            ("signature", signature),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        ShopierForm {
            action: self.payment_url.clone(),
            fields,
        }
    }

    /// Check the OSB credentials carried by a callback.
    #[must_use]
    pub fn verify_osb(&self, notification: &OsbNotification) -> bool {
        let (Some(username), Some(password)) = (&self.osb_username, &self.osb_password) else {
            return false;
        };
        // Both comparisons always run.
        let user_ok = constant_time_eq(username, &notification.api_key);
        let pass_ok = constant_time_eq(password, &notification.api_secret);
        user_ok & pass_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditline_core::PricingConfig;

    fn gateway() -> ShopierGateway {
        ShopierGateway::new(
            "key",
            "secret",
            "https://www.shopier.com/ShowProduct/api_pay4.php",
            "https://api.example.com/payments/shopier/return",
        )
        .with_osb_credentials(Some("osb-user".into()), Some("osb-pass".into()))
    }

    fn notification(user: &str, pass: &str) -> OsbNotification {
        OsbNotification {
            api_key: user.into(),
            api_secret: pass.into(),
            platform_order_id: "ORD-1".into(),
            status: "success".into(),
            payment_status: "paid".into(),
            buyer_email: None,
            total_order_price: None,
            currency: None,
        }
    }

    #[test]
    fn form_is_signed_over_nonce_order_total_and_currency() {
        let pricing = PricingConfig::default();
        let package = pricing.package("popular").unwrap();
        let form = gateway().payment_form_with_nonce("ORD-1", package, Some("a@b.c"), "123456");

        assert_eq!(form.fields["total_order_value"], "249.00");
        assert_eq!(form.fields["currency"], "0");
        assert_eq!(
            form.fields["signature"],
            hmac_sha256_base64("secret", "123456ORD-1249.000")
        );
        assert_eq!(form.fields["buyer_email"], "a@b.c");
    }

    #[test]
    fn osb_credentials_must_both_match() {
        let gateway = gateway();
        assert!(gateway.verify_osb(&notification("osb-user", "osb-pass")));
        assert!(!gateway.verify_osb(&notification("osb-user", "wrong")));
        assert!(!gateway.verify_osb(&notification("other", "osb-pass")));
    }

    #[test]
    fn osb_without_configured_credentials_is_rejected() {
        let gateway = ShopierGateway::new("k", "s", "u", "c");
        assert!(!gateway.accepts_osb());
        assert!(!gateway.verify_osb(&notification("", "")));
    }

    #[test]
    fn status_flags() {
        let mut n = notification("a", "b");
        assert!(n.is_paid());
        n.payment_status = "pending".into();
        assert!(!n.is_paid());
        n.status = "failed".into();
        assert!(n.is_failed());
    }

    #[test]
    fn amounts_format_with_two_decimals() {
        assert_eq!(format_amount(9_900), "99.00");
        assert_eq!(format_amount(5), "0.05");
    }
}
