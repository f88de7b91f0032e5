//! Payment provider abstraction layer
//!
//! This module defines the `PaymentProvider` trait, one implementation per payment rail:
//!
//! - [`card_gateway::CardGatewayProvider`] for cards and gateway-issued virtual accounts
//! - [`wallet_gateway::WalletGatewayProvider`] for app-based redirect wallets
//! - [`manual_transfer::ManualTransferProvider`] for deposits into a static bank account
//! - [`dummy::DummyProvider`] which approves everything, for development
//!
//! Providers only talk to the outside world. They never write orders or balances; the
//! checkout services do that with what the providers return.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    config::PaymentConfig,
    db::models::orders::{Order, PaymentMethod, VirtualAccountInfo},
    types::{Amount, OrderId, UserId},
};

pub mod card_gateway;
pub mod dummy;
pub mod manual_transfer;
pub mod signing;
pub mod wallet_gateway;

/// Result type for payment provider operations
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Errors that can occur during payment processing
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment provider API error: {0}")]
    ProviderApi(String),

    #[error("Invalid payment data: {0}")]
    InvalidData(String),

    #[error("Webhook signature is invalid")]
    SignatureInvalid,

    #[error("Payment not approved: {0}")]
    NotApproved(String),

    #[error("Approved amount {approved} does not match expected {expected}")]
    AmountMismatch { expected: Amount, approved: Amount },

    #[error("HTTP error talking to payment provider: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No payment provider configured for {0}")]
    UnsupportedMethod(PaymentMethod),
}

/// Identifies a provider in URLs (`/payments/{provider}/return`, `/webhooks/{provider}`)
/// and in the payment transaction log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    CardGateway,
    WalletGateway,
    ManualTransfer,
    Dummy,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::CardGateway => "card_gateway",
            ProviderKind::WalletGateway => "wallet_gateway",
            ProviderKind::ManualTransfer => "manual_transfer",
            ProviderKind::Dummy => "dummy",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "card_gateway" => Ok(ProviderKind::CardGateway),
            "wallet_gateway" => Ok(ProviderKind::WalletGateway),
            "manual_transfer" => Ok(ProviderKind::ManualTransfer),
            "dummy" => Ok(ProviderKind::Dummy),
            other => Err(PaymentError::InvalidData(format!("Unknown payment provider: {other}"))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Buyer details some gateways require on the checkout form.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Buyer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Everything a provider needs to issue a payment intent for a freshly inserted order.
#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub user_id: UserId,
    pub order_id: OrderId,
    pub order_number: String,
    pub amount: Amount,
    pub method: PaymentMethod,
    /// Where the provider sends the buyer back to; carries the order id
    pub return_url: String,
    pub buyer: Buyer,
    /// Short description shown on the gateway page
    pub goods_name: String,
    pub depositor_name: Option<String>,
}

/// A form the client submits to continue at the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedirectForm {
    pub action: String,
    pub method: String,
    pub fields: BTreeMap<String, String>,
}

/// What the client does next.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntentAction {
    /// Submit the form to the provider
    Redirect { form: RedirectForm },
    /// Deposit into this account
    Deposit { account: VirtualAccountInfo },
}

/// An issued payment intent.
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub action: IntentAction,
    /// Provider-side reference, when one exists before approval
    pub provider_ref: Option<String>,
    pub raw_request: Value,
    pub raw_response: Option<Value>,
}

/// Confirmation data a provider hands back after the buyer finished at its page.
#[derive(Debug, Clone)]
pub struct ApprovalRequest<'a> {
    pub order: &'a Order,
    /// Every parameter of the return request
    pub raw_confirmation: &'a Map<String, Value>,
}

/// Funds were captured.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    /// In the order currency
    pub approved_amount: Amount,
    pub provider_transaction_id: String,
    pub raw_response: Value,
}

/// Outcome of a successful `approve`.
#[derive(Debug, Clone, PartialEq)]
pub enum Approval {
    Captured(Capture),
    /// A virtual account was issued; payment arrives later by webhook
    DepositPending {
        account: Option<VirtualAccountInfo>,
        provider_transaction_id: Option<String>,
        raw_response: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventType {
    PaymentPaid,
    PaymentFailed,
    VirtualAccountIssued,
    Other(String),
}

impl WebhookEventType {
    pub fn parse(value: &str) -> Self {
        match value {
            "payment.paid" => WebhookEventType::PaymentPaid,
            "payment.failed" => WebhookEventType::PaymentFailed,
            "vbank.issued" => WebhookEventType::VirtualAccountIssued,
            other => WebhookEventType::Other(other.to_string()),
        }
    }
}

/// A validated webhook delivery, normalized across providers.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub event_type: WebhookEventType,
    pub order_id: OrderId,
    pub provider_transaction_id: Option<String>,
    /// In the order currency
    pub approved_amount: Option<Amount>,
    pub account: Option<VirtualAccountInfo>,
    pub reason: Option<String>,
    pub raw: Value,
}

/// Abstract payment provider interface
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Issue a payment intent for an inserted order.
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent>;

    /// Confirm with the provider that the buyer actually paid.
    ///
    /// Never trusts the client-supplied confirmation alone; remote providers are asked
    /// server-to-server.
    async fn approve(&self, request: &ApprovalRequest<'_>) -> Result<Approval>;

    /// Cancel or refund the payment behind an order at the provider.
    async fn cancel(&self, order: &Order, reason: &str) -> Result<()>;

    /// Validate and extract webhook event from raw request data
    ///
    /// Returns None if this provider doesn't support webhooks.
    /// Returns Err if validation fails (invalid signature, malformed data, etc.)
    async fn validate_webhook(&self, headers: &HeaderMap, body: &str) -> Result<Option<WebhookEvent>>;
}

/// The providers enabled by configuration, keyed by payment rail.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    card: Option<Arc<dyn PaymentProvider>>,
    wallet: Option<Arc<dyn PaymentProvider>>,
    manual: Option<Arc<dyn PaymentProvider>>,
    dummy: Option<Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    /// Build the registry from configuration
    ///
    /// This is the single point where we convert config into provider instances.
    pub fn from_config(config: &PaymentConfig) -> anyhow::Result<Self> {
        let mut registry = Self::default();
        if let Some(card) = &config.card_gateway {
            registry.card = Some(Arc::new(card_gateway::CardGatewayProvider::new(card.clone())?));
        }
        if let Some(wallet) = &config.wallet_gateway {
            registry.wallet = Some(Arc::new(wallet_gateway::WalletGatewayProvider::new(wallet.clone())?));
        }
        if config.manual_transfer.enabled {
            registry.manual = Some(Arc::new(manual_transfer::ManualTransferProvider::from(config.manual_transfer.clone())));
        }
        if config.dummy.enabled {
            registry.dummy = Some(Arc::new(dummy::DummyProvider::default()));
        }
        Ok(registry)
    }

    /// Register a provider under its own kind, replacing any previous one
    pub fn with_provider(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        match provider.kind() {
            ProviderKind::CardGateway => self.card = Some(provider),
            ProviderKind::WalletGateway => self.wallet = Some(provider),
            ProviderKind::ManualTransfer => self.manual = Some(provider),
            ProviderKind::Dummy => self.dummy = Some(provider),
        }
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn PaymentProvider>> {
        match kind {
            ProviderKind::CardGateway => self.card.clone(),
            ProviderKind::WalletGateway => self.wallet.clone(),
            ProviderKind::ManualTransfer => self.manual.clone(),
            ProviderKind::Dummy => self.dummy.clone(),
        }
    }

    /// Pick the provider for a payment method. The dummy provider fills any rail that has
    /// no real provider configured. Ledger purchases have no provider.
    pub fn for_method(&self, method: PaymentMethod) -> Result<Arc<dyn PaymentProvider>> {
        let configured = match method {
            PaymentMethod::Card | PaymentMethod::VirtualAccount => self.card.clone(),
            PaymentMethod::WalletRedirect => self.wallet.clone(),
            PaymentMethod::ManualBankTransfer => self.manual.clone(),
            PaymentMethod::Ledger => return Err(PaymentError::UnsupportedMethod(method)),
        };
        configured.or_else(|| self.dummy.clone()).ok_or(PaymentError::UnsupportedMethod(method))
    }

    /// Provider recorded for an order's method, used when cancelling or refunding.
    pub fn for_order(&self, order: &Order) -> Option<Arc<dyn PaymentProvider>> {
        self.for_method(order.payment_method).ok()
    }
}

/// Read a header as a string, or fail as invalid data.
pub(crate) fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .ok_or_else(|| PaymentError::InvalidData(format!("Missing {name} header")))?
        .to_str()
        .map_err(|_| PaymentError::InvalidData(format!("Invalid {name} header")))
}

/// Read a string parameter from a raw confirmation.
pub(crate) fn confirmation_str<'a>(raw: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    raw.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Accepts amounts sent either as JSON numbers or numeric strings.
pub(crate) fn parse_amount(value: &Value) -> Option<Amount> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
