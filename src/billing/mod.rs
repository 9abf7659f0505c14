// Payment gateway adapter: Stripe client, invoicing and webhooks
pub mod service;
pub mod stripe;
pub mod webhook;
