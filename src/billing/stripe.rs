use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{AppError, AppResult, GatewayError};
use crate::ledger::models::SubscriptionTier;

pub const DEFAULT_API_BASE: &str = "https://api.stripe.com/v1";

/// Stripe credentials and price table
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub publishable_key: Option<String>,
    pub api_base: String,
    /// Max webhook timestamp age in seconds, 0 disables the check
    pub webhook_tolerance_secs: u64,
    pub prices: HashMap<SubscriptionTier, String>,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            webhook_secret: None,
            publishable_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            webhook_tolerance_secs: 300,
            prices: HashMap::new(),
        }
    }
}

/// One-time charge attached to a specific draft invoice
#[derive(Debug, Clone)]
pub struct InvoiceItemRequest {
    pub customer_id: String,
    pub invoice_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct InvoiceRequest {
    pub customer_id: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayInvoice {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl GatewayInvoice {
    pub fn is_draft(&self) -> bool {
        self.status.as_deref() == Some("draft")
    }

    pub fn is_void(&self) -> bool {
        self.status.as_deref() == Some("void")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayInvoiceItem {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub invoice: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySubscription {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct StripeObjectId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

/// Outbound payment-gateway surface
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// False when no credentials are present; callers skip invoicing
    fn is_configured(&self) -> bool;

    async fn create_customer(&self, email: &str, name: Option<&str>, metadata: &HashMap<String, String>) -> AppResult<String>;

    /// Adds the line to `request.invoice_id`, never to the customer's pending items
    async fn create_invoice_item(&self, request: &InvoiceItemRequest, idempotency_key: &str) -> AppResult<String>;

    /// Creates an empty draft that does not sweep up pending invoice items
    async fn create_invoice(&self, request: &InvoiceRequest, idempotency_key: &str) -> AppResult<GatewayInvoice>;

    /// Most recent invoices of a customer, any status
    async fn list_invoices(&self, customer_id: &str) -> AppResult<Vec<GatewayInvoice>>;

    async fn list_invoice_items(&self, invoice_id: &str) -> AppResult<Vec<GatewayInvoiceItem>>;

    async fn finalize_invoice(&self, invoice_id: &str) -> AppResult<GatewayInvoice>;

    async fn pay_invoice(&self, invoice_id: &str) -> AppResult<GatewayInvoice>;

    async fn get_invoice(&self, invoice_id: &str) -> AppResult<GatewayInvoice>;

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: &HashMap<String, String>,
    ) -> AppResult<GatewaySubscription>;

    /// Cancels at the end of the current billing period
    async fn cancel_subscription(&self, subscription_id: &str) -> AppResult<GatewaySubscription>;

    async fn create_checkout_session(&self, request: &CheckoutRequest) -> AppResult<CheckoutSession>;

    async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> AppResult<PortalSession>;
}

/// Stripe REST client (form-encoded requests, basic auth with the secret key)
pub struct StripeClient {
    config: StripeConfig,
    client: reqwest::Client,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn secret_key(&self) -> AppResult<&str> {
        self.config
            .secret_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| GatewayError::NotConfigured.into())
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> AppResult<T> {
        let url = format!("{}{}", self.config.api_base, path);
        let mut request = self
            .client
            .post(&url)
            .basic_auth(self.secret_key()?, None::<&str>)
            .form(form);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        debug!("Stripe POST {}", path);
        let response = request.send().await?;
        Self::decode(response).await
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> AppResult<T> {
        let url = format!("{}{}", self.config.api_base, path);
        let response = self
            .client
            .get(&url)
            .basic_auth(self.secret_key()?, None::<&str>)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> AppResult<T> {
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<StripeErrorBody>(&error_text)
                .ok()
                .and_then(|body| body.error.message)
                .unwrap_or(error_text);
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message,
            }
            .into());
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            AppError::Gateway(GatewayError::Api {
                status: status.as_u16(),
                message: format!("Unexpected Stripe response: {}", e),
            })
        })
    }
}

fn metadata_fields(prefix: &str, metadata: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = metadata
        .iter()
        .map(|(key, value)| (format!("{}[{}]", prefix, key), value.clone()))
        .collect();
    fields.sort();
    fields
}

#[async_trait]
impl PaymentGateway for StripeClient {
    fn is_configured(&self) -> bool {
        self.secret_key().is_ok()
    }

    async fn create_customer(&self, email: &str, name: Option<&str>, metadata: &HashMap<String, String>) -> AppResult<String> {
        let mut form = vec![("email".to_string(), email.to_string())];
        if let Some(name) = name {
            form.push(("name".to_string(), name.to_string()));
        }
        form.extend(metadata_fields("metadata", metadata));

        let customer: StripeObjectId = self.post("/customers", &form, None).await?;
        info!("👤 Stripe customer created: {}", customer.id);
        Ok(customer.id)
    }

    async fn create_invoice_item(&self, request: &InvoiceItemRequest, idempotency_key: &str) -> AppResult<String> {
        let mut form = vec![
            ("customer".to_string(), request.customer_id.clone()),
            ("invoice".to_string(), request.invoice_id.clone()),
            ("amount".to_string(), request.amount_cents.to_string()),
            ("currency".to_string(), request.currency.clone()),
            ("description".to_string(), request.description.clone()),
        ];
        form.extend(metadata_fields("metadata", &request.metadata));

        let item: StripeObjectId = self.post("/invoiceitems", &form, Some(idempotency_key)).await?;
        Ok(item.id)
    }

    async fn create_invoice(&self, request: &InvoiceRequest, idempotency_key: &str) -> AppResult<GatewayInvoice> {
        let mut form = vec![
            ("customer".to_string(), request.customer_id.clone()),
            ("collection_method".to_string(), "charge_automatically".to_string()),
            ("auto_advance".to_string(), "false".to_string()),
            ("pending_invoice_items_behavior".to_string(), "exclude".to_string()),
            ("description".to_string(), request.description.clone()),
        ];
        form.extend(metadata_fields("metadata", &request.metadata));

        self.post("/invoices", &form, Some(idempotency_key)).await
    }

    async fn list_invoices(&self, customer_id: &str) -> AppResult<Vec<GatewayInvoice>> {
        let list: StripeList<GatewayInvoice> = self
            .get(&format!("/invoices?customer={}&limit=100", customer_id))
            .await?;
        Ok(list.data)
    }

    async fn list_invoice_items(&self, invoice_id: &str) -> AppResult<Vec<GatewayInvoiceItem>> {
        let list: StripeList<GatewayInvoiceItem> = self
            .get(&format!("/invoiceitems?invoice={}&limit=100", invoice_id))
            .await?;
        Ok(list.data)
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> AppResult<GatewayInvoice> {
        let form = vec![("auto_advance".to_string(), "true".to_string())];
        self.post(&format!("/invoices/{}/finalize", invoice_id), &form, None).await
    }

    async fn pay_invoice(&self, invoice_id: &str) -> AppResult<GatewayInvoice> {
        self.post(&format!("/invoices/{}/pay", invoice_id), &[], None).await
    }

    async fn get_invoice(&self, invoice_id: &str) -> AppResult<GatewayInvoice> {
        self.get(&format!("/invoices/{}", invoice_id)).await
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: &HashMap<String, String>,
    ) -> AppResult<GatewaySubscription> {
        let mut form = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("items[0][price]".to_string(), price_id.to_string()),
        ];
        form.extend(metadata_fields("metadata", metadata));

        self.post("/subscriptions", &form, None).await
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> AppResult<GatewaySubscription> {
        let form = vec![("cancel_at_period_end".to_string(), "true".to_string())];
        self.post(&format!("/subscriptions/{}", subscription_id), &form, None)
            .await
    }

    async fn create_checkout_session(&self, request: &CheckoutRequest) -> AppResult<CheckoutSession> {
        let mut form = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("customer".to_string(), request.customer_id.clone()),
            ("line_items[0][price]".to_string(), request.price_id.clone()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
        ];
        form.extend(metadata_fields("subscription_data[metadata]", &request.metadata));

        self.post("/checkout/sessions", &form, None).await
    }

    async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> AppResult<PortalSession> {
        let form = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("return_url".to_string(), return_url.to_string()),
        ];
        self.post("/billing_portal/sessions", &form, None).await
    }
}
