mod allura;
mod project_hosting;

pub use allura::{api_url as allura_api_url, Allura};
pub use project_hosting::ProjectHosting;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Allura(#[from] allura::Error),
    #[error(transparent)]
    ProjectHosting(#[from] project_hosting::Error),
}

/// Issue tracker a code review upload gets linked to
pub trait Tracker {
    /// Files a new issue and returns its number
    fn create_issue(&self, subject: &str, description: &str) -> Result<u64, Error>;

    /// Adds `description` as a note to an existing issue and flags it as having a new patch.
    ///
    /// Returns `None` if the tracker refused the update in a way that should not abort the
    /// upload. The reason has already been logged in that case.
    fn update_issue(&self, id: u64, description: &str) -> Result<Option<u64>, Error>;

    /// Human-readable web address of an issue
    fn issue_url(&self, id: u64) -> String;

    fn name(&self) -> &'static str;
}

/// HTTP client preloaded with our user agent and `headers`
pub(crate) fn http_client(mut headers: HeaderMap, timeout: Duration) -> reqwest::Result<Client> {
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        )),
    );
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
}

/// Renders form data for error messages, hiding credentials
fn show_form(form: &[(&str, &str)]) -> String {
    let fields: Vec<String> = form
        .iter()
        .map(|(k, v)| match *k {
            "access_token" => format!("{}=********", k),
            _ => format!("{}={:?}", k, v),
        })
        .collect();
    format!("{{{}}}", fields.join(", "))
}
