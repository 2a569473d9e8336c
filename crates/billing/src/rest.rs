//! REST adapter for the payment provider
//!
//! Talks to the provider's form-encoded HTTP API directly. Idempotent
//! reads are retried with exponential backoff; mutations are sent once
//! and their failures surfaced as `ProviderUnavailable`.

use serde_json::Value;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use async_trait::async_trait;
use quotekit_shared::{PaymentMethod, Subscription, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    InvoiceDownload, PaymentProvider, PlanChangeOutcome, ProrationPreview, ProviderInvoice,
};

/// Provider connection settings, loaded from the environment.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_base: String,
    pub secret_key: String,
}

impl ProviderConfig {
    pub fn from_env() -> BillingResult<Self> {
        let api_base = std::env::var("PROVIDER_API_BASE")
            .unwrap_or_else(|_| "https://api.stripe.com".to_string());
        let secret_key = std::env::var("PROVIDER_SECRET_KEY")
            .map_err(|_| BillingError::Config("PROVIDER_SECRET_KEY not set".to_string()))?;
        Ok(Self {
            api_base,
            secret_key,
        })
    }
}

/// Production [`PaymentProvider`] backed by the provider's REST API.
#[derive(Clone)]
pub struct RestPaymentProvider {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl RestPaymentProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(ProviderConfig::from_env()?))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base, path)
    }

    fn retry_strategy() -> impl Iterator<Item = std::time::Duration> {
        ExponentialBackoff::from_millis(100).map(jitter).take(3)
    }

    /// GET with backoff. Only used for idempotent reads.
    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> BillingResult<Value> {
        let url = self.url(path);
        Retry::spawn(Self::retry_strategy(), || async {
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.config.secret_key)
                .query(query)
                .send()
                .await
                .map_err(|e| BillingError::ProviderUnavailable(e.to_string()))?;
            Self::check_and_parse(response).await
        })
        .await
    }

    /// POST a form-encoded body. Sent once, no retry.
    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> BillingResult<Value> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.config.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| BillingError::ProviderUnavailable(e.to_string()))?;
        Self::check_and_parse(response).await
    }

    async fn delete(&self, path: &str) -> BillingResult<Value> {
        let response = self
            .http
            .delete(self.url(path))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(|e| BillingError::ProviderUnavailable(e.to_string()))?;
        Self::check_and_parse(response).await
    }

    async fn check_and_parse(response: reqwest::Response) -> BillingResult<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Provider API call failed");
            return Err(BillingError::ProviderUnavailable(format!(
                "provider returned {}: {}",
                status, body
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| BillingError::ProviderUnavailable(format!("bad provider response: {}", e)))
    }

    fn parse_status(raw: &str) -> SubscriptionStatus {
        // Unknown intermediate statuses surface as past_due so the UI
        // draws attention instead of silently showing active.
        SubscriptionStatus::parse(raw).unwrap_or(SubscriptionStatus::PastDue)
    }

    fn subscription_from_json(v: &Value) -> Subscription {
        let timestamp = |field: &str| {
            v[field]
                .as_i64()
                .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
        };
        Subscription {
            provider_subscription_id: v["id"].as_str().map(str::to_string),
            provider_customer_id: v["customer"].as_str().map(str::to_string),
            price_id: v["items"]["data"][0]["price"]["id"]
                .as_str()
                .map(str::to_string),
            status: Self::parse_status(v["status"].as_str().unwrap_or_default()),
            current_period_start: timestamp("current_period_start"),
            current_period_end: timestamp("current_period_end"),
            cancel_at_period_end: v["cancel_at_period_end"].as_bool().unwrap_or(false),
        }
    }
}

#[async_trait]
impl PaymentProvider for RestPaymentProvider {
    async fn list_payment_methods(&self, customer_id: &str) -> BillingResult<Vec<PaymentMethod>> {
        let body = self
            .get_json(
                &format!("/v1/customers/{}/payment_methods", customer_id),
                &[("type", "card")],
            )
            .await?;

        // The default flag lives on the customer, not the instrument.
        let customer = self
            .get_json(&format!("/v1/customers/{}", customer_id), &[])
            .await?;
        let default_id = customer["invoice_settings"]["default_payment_method"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let methods = body["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let id = item["id"].as_str()?.to_string();
                        let card = &item["card"];
                        Some(PaymentMethod {
                            is_default: id == default_id,
                            brand: card["brand"].as_str().unwrap_or("unknown").to_string(),
                            last4: card["last4"].as_str().unwrap_or("").to_string(),
                            exp_month: card["exp_month"].as_u64().unwrap_or(1) as u8,
                            exp_year: card["exp_year"].as_i64().unwrap_or(0) as i32,
                            funding: card["funding"].as_str().unwrap_or("credit").to_string(),
                            customer_id: customer_id.to_string(),
                            id,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(methods)
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        self.post_form(
            &format!("/v1/customers/{}", customer_id),
            &[(
                "invoice_settings[default_payment_method]",
                payment_method_id,
            )],
        )
        .await?;
        tracing::info!(
            customer_id = %customer_id,
            payment_method_id = %payment_method_id,
            "Set default payment method"
        );
        Ok(())
    }

    async fn delete_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        self.post_form(
            &format!("/v1/payment_methods/{}/detach", payment_method_id),
            &[],
        )
        .await?;
        tracing::info!(
            customer_id = %customer_id,
            payment_method_id = %payment_method_id,
            "Detached payment method"
        );
        Ok(())
    }

    async fn preview_plan_change(
        &self,
        customer_id: &str,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<ProrationPreview> {
        if customer_id.is_empty() || subscription_id.is_empty() {
            return Err(BillingError::PreviewUnavailable(
                "missing customer or subscription reference".to_string(),
            ));
        }

        // The current subscription item id is required to express the
        // price swap in the preview request.
        let current = self
            .get_json(&format!("/v1/subscriptions/{}", subscription_id), &[])
            .await?;
        let item_id = current["items"]["data"][0]["id"]
            .as_str()
            .ok_or_else(|| {
                BillingError::PreviewUnavailable("subscription has no items".to_string())
            })?
            .to_string();

        // Nested form parameter format expected by the provider.
        let form_params = [
            ("customer", customer_id),
            ("subscription", subscription_id),
            ("subscription_details[items][0][id]", item_id.as_str()),
            ("subscription_details[items][0][price]", price_id),
            (
                "subscription_details[proration_behavior]",
                "create_prorations",
            ),
        ];

        let preview = self
            .post_form("/v1/invoices/create_preview", &form_params)
            .await?;

        let immediate_total = preview["amount_due"].as_i64().unwrap_or(0);
        let next_invoice_total = preview["total"].as_i64().unwrap_or(immediate_total);
        let currency = preview["currency"].as_str().unwrap_or("usd").to_string();

        // Proration credit/charge is the sum of the proration line items.
        let proration_amount = preview["lines"]["data"]
            .as_array()
            .map(|lines| {
                lines
                    .iter()
                    .filter(|line| line["proration"].as_bool().unwrap_or(false))
                    .filter_map(|line| line["amount"].as_i64())
                    .sum()
            })
            .unwrap_or(0);

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            price_id = %price_id,
            immediate_total = immediate_total,
            proration_amount = proration_amount,
            "Previewed plan change"
        );

        Ok(ProrationPreview {
            immediate_total_cents: immediate_total,
            proration_amount_cents: proration_amount,
            next_invoice_total_cents: next_invoice_total,
            currency,
        })
    }

    async fn change_plan(
        &self,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
        price_id: &str,
        is_upgrade: bool,
        payment_method_id: Option<&str>,
    ) -> BillingResult<PlanChangeOutcome> {
        let Some(sub_id) = subscription_id else {
            // No provider subscription yet (free plan): payment is
            // collected on the provider's hosted checkout page. The
            // provider creates the customer there when none exists.
            let mut form: Vec<(&str, &str)> = vec![
                ("mode", "subscription"),
                ("line_items[0][price]", price_id),
                ("line_items[0][quantity]", "1"),
            ];
            if let Some(customer) = customer_id {
                form.push(("customer", customer));
            }
            let session = self.post_form("/v1/checkout/sessions", &form).await?;
            let checkout_url = session["url"]
                .as_str()
                .ok_or_else(|| {
                    BillingError::ProviderUnavailable(
                        "checkout session missing redirect url".to_string(),
                    )
                })?
                .to_string();
            tracing::info!(customer_id = ?customer_id, price_id = %price_id, "Handing off to hosted checkout");
            return Ok(PlanChangeOutcome::Redirect { checkout_url });
        };

        let current = self
            .get_json(&format!("/v1/subscriptions/{}", sub_id), &[])
            .await?;
        let item_id = current["items"]["data"][0]["id"]
            .as_str()
            .ok_or_else(|| BillingError::Internal("no subscription items found".to_string()))?
            .to_string();

        // Upgrades prorate and bill immediately; downgrades swap the
        // price without proration and the provider applies it at the
        // period boundary.
        let proration = if is_upgrade {
            "create_prorations"
        } else {
            "none"
        };

        let mut form: Vec<(&str, &str)> = vec![
            ("items[0][id]", item_id.as_str()),
            ("items[0][price]", price_id),
            ("proration_behavior", proration),
        ];
        if let Some(pm) = payment_method_id {
            form.push(("default_payment_method", pm));
        }

        let updated = self
            .post_form(&format!("/v1/subscriptions/{}", sub_id), &form)
            .await?;

        tracing::info!(
            subscription_id = %sub_id,
            price_id = %price_id,
            is_upgrade = is_upgrade,
            "Changed subscription plan"
        );

        Ok(PlanChangeOutcome::Completed {
            subscription: Self::subscription_from_json(&updated),
        })
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<Subscription> {
        let updated = if cancel_at_period_end {
            self.post_form(
                &format!("/v1/subscriptions/{}", subscription_id),
                &[("cancel_at_period_end", "true")],
            )
            .await?
        } else {
            self.delete(&format!("/v1/subscriptions/{}", subscription_id))
                .await?
        };

        tracing::info!(
            subscription_id = %subscription_id,
            cancel_at_period_end = cancel_at_period_end,
            "Cancelled subscription"
        );
        Ok(Self::subscription_from_json(&updated))
    }

    async fn reactivate_subscription(&self, subscription_id: &str) -> BillingResult<Subscription> {
        let updated = self
            .post_form(
                &format!("/v1/subscriptions/{}", subscription_id),
                &[("cancel_at_period_end", "false")],
            )
            .await?;

        tracing::info!(subscription_id = %subscription_id, "Reactivated subscription");
        Ok(Self::subscription_from_json(&updated))
    }

    async fn fetch_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let body = self
            .get_json(
                "/v1/subscriptions",
                &[("customer", customer_id), ("status", "all"), ("limit", "10")],
            )
            .await?;

        let subscription = body["data"]
            .as_array()
            .and_then(|subs| {
                subs.iter()
                    .map(Self::subscription_from_json)
                    .find(|s| s.status.is_paid())
            });

        Ok(subscription)
    }

    async fn list_invoices(&self, customer_id: &str) -> BillingResult<Vec<ProviderInvoice>> {
        let body = self
            .get_json(
                "/v1/invoices",
                &[("customer", customer_id), ("limit", "100")],
            )
            .await?;

        let invoices = body["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let id = item["id"].as_str()?.to_string();
                        let created = item["created"]
                            .as_i64()
                            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())?;
                        Some(ProviderInvoice {
                            created,
                            amount_cents: item["total"].as_i64().unwrap_or(0),
                            status: item["status"].as_str().unwrap_or("open").to_string(),
                            hosted_url: item["hosted_invoice_url"].as_str().map(str::to_string),
                            description: item["number"]
                                .as_str()
                                .map(|n| format!("Invoice {}", n))
                                .unwrap_or_else(|| "Invoice".to_string()),
                            id,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(invoices)
    }

    async fn fetch_invoice(&self, invoice_id: &str) -> BillingResult<InvoiceDownload> {
        let body = self
            .get_json(&format!("/v1/invoices/{}", invoice_id), &[])
            .await?;

        let url = body["invoice_pdf"]
            .as_str()
            .or_else(|| body["hosted_invoice_url"].as_str())
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", invoice_id)))?
            .to_string();

        Ok(InvoiceDownload {
            invoice_id: invoice_id.to_string(),
            url,
        })
    }
}
