//! Allura (SourceForge) ticket tracker, spoken to via its REST API.

use super::{http_client, show_form, Tracker};

use colored::*;
use reqwest::blocking::{Client, Response};
use reqwest::header::HeaderMap;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "Allura server `{0}' has unexpected format: expect it to contain /p/ in the URL. \
         Please run `cl-tracker config'"
    )]
    ServerFormat(String),
    #[error("{method} {url} failed with HTTP status {status}; request data was {payload}")]
    Api {
        method: &'static str,
        url: String,
        status: StatusCode,
        payload: String,
    },
    #[error("Unexpected Allura response: cannot find {what} in `{excerpt}'")]
    Malformed {
        what: &'static str,
        excerpt: String,
    },
    #[error("HTTP request error")]
    Request(#[from] reqwest::Error),
}

type Result<T, E = Error> = std::result::Result<T, E>;

const STATUS: &str = "Started";

fn malformed(what: &'static str, body: &str) -> Error {
    Error::Malformed {
        what,
        excerpt: body.chars().take(200).collect(),
    }
}

/// Inserts `/rest` in front of the project path, e.g. `https://host/p/proj/issues/` becomes
/// `https://host/rest/p/proj/issues`.
pub fn api_url(server: &str) -> Result<String> {
    let mut url = Url::parse(server).map_err(|_| Error::ServerFormat(server.to_owned()))?;
    let path = url.path().trim_end_matches('/').to_owned();
    let pos = path
        .find("/p/")
        .ok_or_else(|| Error::ServerFormat(server.to_owned()))?;
    url.set_path(&format!("{}/rest{}", &path[..pos], &path[pos..]));
    Ok(url.to_string())
}

/// Issue number from the last path segment of an issue URL. Exactly one trailing slash is
/// ignored.
pub fn issue_number(url: &Url) -> Result<u64> {
    let path = url.path();
    let path = path.strip_suffix('/').unwrap_or(path);
    path.rsplit('/')
        .next()
        .and_then(|seg| seg.parse().ok())
        .ok_or_else(|| malformed("issue number", url.as_str()))
}

/// Browser URL for a REST URL
fn web_url(url: &Url) -> String {
    url.as_str().replacen("/rest/", "/", 1)
}

/// Depth-first search for the first value stored under `key`
fn find_field<'a>(v: &'a Value, key: &str) -> Option<&'a Value> {
    match v {
        Value::Object(map) => map
            .get(key)
            .or_else(|| map.values().find_map(|v| find_field(v, key))),
        Value::Array(items) => items.iter().find_map(|v| find_field(v, key)),
        _ => None,
    }
}

fn parse_json(body: &str, what: &'static str) -> Result<Value> {
    serde_json::from_str(body).map_err(|_| malformed(what, body))
}

/// User who filed the ticket
fn reporter(body: &str) -> Result<String> {
    let v = parse_json(body, "reported_by")?;
    find_field(&v, "reported_by")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| malformed("reported_by", body))
}

/// Identifier of the discussion thread attached to a ticket
fn thread_id(body: &str) -> Result<String> {
    let v = parse_json(body, "discussion_thread")?;
    let thread =
        find_field(&v, "discussion_thread").ok_or_else(|| malformed("discussion_thread", body))?;
    thread
        .get("_id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| malformed("discussion_thread._id", body))
}

#[derive(Debug, Clone)]
pub struct Allura {
    client: Client,
    token: String,
    /// Ticket tracker web address without trailing slash
    server: String,
    api: String,
}

impl Allura {
    pub fn new(server: &str, token: &str, timeout: Duration) -> Result<Self> {
        let api = api_url(server)?;
        debug!("Allura API: {}", api);
        Ok(Self {
            client: http_client(HeaderMap::new(), timeout)?,
            token: token.to_owned(),
            server: server.trim_end_matches('/').to_owned(),
            api,
        })
    }

    fn post(&self, url: &str, form: &[(&str, &str)]) -> Result<Response> {
        debug!("POST {} {}", url, show_form(form));
        let res = self.client.post(url).form(form).send()?;
        if !res.status().is_success() {
            return Err(Error::Api {
                method: "POST",
                url: url.to_owned(),
                status: res.status(),
                payload: show_form(form),
            });
        }
        Ok(res)
    }

    /// Retrieves a ticket's JSON representation together with the URL it was served from
    fn fetch(&self, id: u64) -> Result<(Url, String)> {
        let url = format!("{}/{}", self.api, id);
        debug!("GET {}", url);
        let res = self.client.get(&url).send()?;
        if !res.status().is_success() {
            return Err(Error::Api {
                method: "GET",
                url,
                status: res.status(),
                payload: "{}".to_owned(),
            });
        }
        let served_from = res.url().clone();
        Ok((served_from, res.text()?))
    }

    fn save_url(&self, id: u64) -> String {
        format!("{}/{}/save", self.api, id)
    }
}

impl Tracker for Allura {
    fn create_issue(&self, subject: &str, description: &str) -> Result<u64, super::Error> {
        let res = self.post(
            &format!("{}/new", self.api),
            &[
                ("access_token", self.token.as_str()),
                ("ticket_form.summary", subject),
                ("ticket_form.description", description),
                ("ticket_form.status", STATUS),
                ("ticket_form.custom_fields._patch", "new"),
                ("ticket_form.custom_fields._type", "Enhancement"),
            ],
        )?;
        let id = issue_number(res.url())?;
        info!("Ticket created at: {}", web_url(res.url()).green());
        // Allura makes the token owner the ticket owner; hand it back to whoever reported it
        let (_, body) = self.fetch(id)?;
        let reporter = reporter(&body)?;
        debug!("Assigning #{} to {}", id, reporter);
        self.post(
            &self.save_url(id),
            &[
                ("access_token", self.token.as_str()),
                ("ticket_form.assigned_to", reporter.as_str()),
            ],
        )?;
        Ok(id)
    }

    fn update_issue(&self, id: u64, description: &str) -> Result<Option<u64>, super::Error> {
        self.post(
            &self.save_url(id),
            &[
                ("access_token", self.token.as_str()),
                ("ticket_form.status", STATUS),
                ("ticket_form.custom_fields._patch", "new"),
            ],
        )?;
        let (url, body) = self.fetch(id)?;
        let thread = thread_id(&body)?;
        let number = issue_number(&url)?;
        self.post(
            &format!("{}/_discuss/thread/{}/new", self.api, thread),
            &[("access_token", self.token.as_str()), ("text", description)],
        )?;
        info!("Ticket {} updated", self.issue_url(number).green());
        Ok(Some(number))
    }

    fn issue_url(&self, id: u64) -> String {
        format!("{}/{}/", self.server, id)
    }

    fn name(&self) -> &'static str {
        "Allura"
    }
}
