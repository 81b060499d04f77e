//! Provider clients: the marketing-list provider (MLP) and the
//! digital-downloads store (DDS), sharing one HTTP core.

pub mod dds;
pub mod http;
pub mod mlp;

pub use dds::{DdsApi, DdsClient};
pub use http::{Auth, Http, RetryPolicy};
pub use mlp::{MlpApi, MlpClient};
