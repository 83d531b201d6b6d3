// Scribe API HTTP handlers
//
// Thin translation layer between HTTP and the core: caller extraction,
// task routes and the signature-verified webhook endpoints.

pub mod caller;
pub mod routes;
pub mod webhooks;

use std::sync::Arc;

use crate::admission::TaskAdmission;
use crate::billing::BillingLedger;
use crate::executor::TaskExecutor;
use crate::metrics::Metrics;
use crate::store::sqlite::SqliteStore;

/// Everything the handlers need, wired once at the composition root.
pub struct AppContext {
    pub store: Arc<SqliteStore>,
    pub admission: Arc<TaskAdmission>,
    pub executor: Arc<TaskExecutor>,
    pub billing: BillingLedger,
    pub metrics: Metrics,
    pub stt_webhook_secret: Option<String>,
    pub subscription_webhook_secret: Option<String>,
}

pub use self::caller::caller_from_request;
pub use self::routes::{get_task, list_tasks, metrics_endpoint, service_status, submit_task};
pub use self::webhooks::{stt_webhook, subscription_webhook};
