//! Project hosting issue tracker (Google Code style GData API).
//!
//! Issues and comments are posted as Atom entries. The tracker answers with the created entry,
//! whose `<id>` ends in the issue number.

use super::{http_client, Tracker};

use colored::*;
use lazy_static::lazy_static;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("POST {url} failed with HTTP status {status}: {excerpt}")]
    Api {
        url: String,
        status: StatusCode,
        excerpt: String,
    },
    #[error("Unexpected project hosting response: cannot find {what} in `{excerpt}'")]
    Malformed {
        what: &'static str,
        excerpt: String,
    },
    #[error("Trying to construct invalid HTTP header")]
    Header(#[from] InvalidHeaderValue),
    #[error("HTTP request error")]
    Request(#[from] reqwest::Error),
}

type Result<T, E = Error> = std::result::Result<T, E>;

const ATOM_NS: &str = "http://www.w3.org/2005/Atom";
const ISSUES_NS: &str = "http://schemas.google.com/projecthosting/issues/2009";
const STATUS: &str = "Started";
const PERMISSION_DENIED: &str = "No permission to edit issue";
const NO_UPDATES: &str = "There were no updates performed.";

lazy_static! {
    static ref TRAILING_NUM: Regex = Regex::new(r"(\d+)\D*$").unwrap();
}

fn excerpt(body: &str) -> String {
    body.trim().chars().take(200).collect()
}

fn malformed(what: &'static str, body: &str) -> Error {
    Error::Malformed {
        what,
        excerpt: excerpt(body),
    }
}

/// Why the tracker refused a comment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    PermissionDenied,
    NoUpdates,
    Other,
}

impl Rejection {
    fn classify(body: &str) -> Self {
        if body.contains(PERMISSION_DENIED) {
            Rejection::PermissionDenied
        } else if body.contains(NO_UPDATES) {
            Rejection::NoUpdates
        } else {
            Rejection::Other
        }
    }
}

/// Issue fields changed along with a comment
#[derive(Debug, Clone, Default)]
struct Updates<'a> {
    status: Option<&'a str>,
    owner: Option<&'a str>,
    labels: &'a [&'a str],
}

impl Updates<'_> {
    fn to_xml(&self) -> String {
        let mut fields = String::new();
        if let Some(status) = self.status {
            fields.push_str(&format!("    <issues:status>{}</issues:status>\n", escape(status)));
        }
        if let Some(owner) = self.owner {
            fields.push_str(&format!(
                "    <issues:ownerUpdate>{}</issues:ownerUpdate>\n",
                escape(owner)
            ));
        }
        for label in self.labels {
            fields.push_str(&format!("    <issues:label>{}</issues:label>\n", escape(*label)));
        }
        if fields.is_empty() {
            "  <issues:updates/>\n".to_owned()
        } else {
            format!("  <issues:updates>\n{}  </issues:updates>\n", fields)
        }
    }
}

/// Atom entry with optional title; `fields` is spliced in verbatim
fn entry(title: Option<&str>, content: &str, author: &str, fields: &str) -> String {
    let mut xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<entry xmlns=\"{}\" xmlns:issues=\"{}\">\n",
        ATOM_NS, ISSUES_NS
    );
    if let Some(title) = title {
        xml.push_str(&format!("  <title>{}</title>\n", escape(title)));
    }
    xml.push_str(&format!(
        "  <content type=\"text\">{}</content>\n",
        escape(content)
    ));
    xml.push_str(&format!("  <author><name>{}</name></author>\n", escape(author)));
    xml.push_str(fields);
    xml.push_str("</entry>\n");
    xml
}

/// Issue number contained in the `<id>` of a returned Atom entry
fn entry_id(body: &str) -> Result<u64> {
    let mut reader = Reader::from_str(body);
    let mut in_id = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"id" => in_id = true,
            Ok(Event::Text(ref t)) if in_id => {
                let text = t.unescape().map_err(|_| malformed("id", body))?;
                return TRAILING_NUM
                    .captures(&text)
                    .and_then(|cap| cap[1].parse().ok())
                    .ok_or_else(|| malformed("issue number", body));
            }
            Ok(Event::End(_)) => in_id = false,
            Ok(Event::Eof) | Err(_) => return Err(malformed("id", body)),
            _ => (),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectHosting {
    client: Client,
    server: String,
    project: String,
    user: String,
}

impl ProjectHosting {
    pub fn new(
        server: &str,
        project: &str,
        user: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, format!("GoogleLogin auth={}", token).parse()?);
        h.insert("gdata-version", HeaderValue::from_static("2"));
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/atom+xml"));
        Ok(Self {
            client: http_client(h, timeout)?,
            server: server.trim_end_matches('/').to_owned(),
            project: project.to_owned(),
            user: user.to_owned(),
        })
    }

    fn issues_feed(&self) -> String {
        format!(
            "{}/feeds/issues/p/{}/issues/full",
            self.server, self.project
        )
    }

    fn comments_feed(&self, id: u64) -> String {
        format!(
            "{}/feeds/issues/p/{}/issues/{}/comments/full",
            self.server, self.project, id
        )
    }

    fn post(&self, url: &str, entry: String) -> Result<(StatusCode, String)> {
        debug!("POST {}\n{}", url, entry);
        let res = self.client.post(url).body(entry).send()?;
        let status = res.status();
        Ok((status, res.text()?))
    }

    fn comment(&self, id: u64, text: &str, updates: &Updates) -> Result<(StatusCode, String)> {
        let entry = entry(None, text, &self.user, &updates.to_xml());
        self.post(&self.comments_feed(id), entry)
    }
}

impl Tracker for ProjectHosting {
    fn create_issue(&self, subject: &str, description: &str) -> Result<u64, super::Error> {
        let mut fields = format!(
            "  <issues:status>{}</issues:status>\n  \
             <issues:owner><issues:username>{}</issues:username></issues:owner>\n",
            STATUS,
            escape(self.user.as_str())
        );
        for label in &["Patch-new", "Type-Other"] {
            fields.push_str(&format!("  <issues:label>{}</issues:label>\n", label));
        }
        let title = format!("Patch: {}", subject);
        let url = self.issues_feed();
        let entry = entry(Some(title.as_str()), description, &self.user, &fields);
        let (status, body) = self.post(&url, entry)?;
        if !status.is_success() {
            return Err(Error::Api {
                url,
                status,
                excerpt: excerpt(&body),
            }
            .into());
        }
        let id = entry_id(&body)?;
        info!("Issue created at: {}", self.issue_url(id).green());
        Ok(id)
    }

    fn update_issue(&self, id: u64, description: &str) -> Result<Option<u64>, super::Error> {
        let updates = Updates {
            status: Some(STATUS),
            owner: Some(self.user.as_str()),
            labels: &["Patch-new"],
        };
        let (status, body) = self.comment(id, description, &updates)?;
        if status.is_success() {
            info!("Issue {} updated", self.issue_url(id).green());
            return Ok(Some(id));
        }
        match Rejection::classify(&body) {
            Rejection::NoUpdates => {
                debug!("Issue {}: nothing to update", id);
                Ok(Some(id))
            }
            Rejection::PermissionDenied if !description.trim().is_empty() => {
                warn!(
                    "No permission to edit issue {}, adding comment only",
                    id.to_string().yellow()
                );
                let (status, body) = self.comment(id, description, &Updates::default())?;
                if status.is_success() {
                    Ok(Some(id))
                } else {
                    warn!(
                        "Failed to comment on issue {}: {} {}",
                        id.to_string().yellow(),
                        status,
                        excerpt(&body)
                    );
                    Ok(None)
                }
            }
            _ => {
                warn!(
                    "Failed to update issue {}: {} {}",
                    id.to_string().yellow(),
                    status,
                    excerpt(&body)
                );
                Ok(None)
            }
        }
    }

    fn issue_url(&self, id: u64) -> String {
        format!(
            "{}/p/{}/issues/detail?id={}",
            self.server, self.project, id
        )
    }

    fn name(&self) -> &'static str {
        "project hosting"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert_matches::assert_matches;
    use mockito::Matcher;

    const FEED: &str = "/feeds/issues/p/lilypond/issues/full";
    const COMMENTS: &str = "/feeds/issues/p/lilypond/issues/1234/comments/full";

    const CREATED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<entry xmlns="http://www.w3.org/2005/Atom" xmlns:issues="http://schemas.google.com/projecthosting/issues/2009">
  <id>http://code.google.com/feeds/issues/p/lilypond/issues/full/1234</id>
  <published>2011-03-02T10:00:00.000Z</published>
  <title>Patch: Beams</title>
  <author><name>joe</name></author>
  <issues:id>1234</issues:id>
</entry>"#;

    fn hosting(base: &str) -> ProjectHosting {
        ProjectHosting::new(base, "lilypond", "joe", "secret", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn classify_rejections() {
        assert_eq!(
            Rejection::classify("No permission to edit issue"),
            Rejection::PermissionDenied
        );
        assert_eq!(
            Rejection::classify("<errors>There were no updates performed.</errors>"),
            Rejection::NoUpdates
        );
        assert_eq!(Rejection::classify("Internal error"), Rejection::Other);
    }

    #[test]
    fn issue_number_from_entry() {
        assert_eq!(entry_id(CREATED).unwrap(), 1234);
        assert_matches!(
            entry_id("<entry><title>x</title></entry>"),
            Err(Error::Malformed { what: "id", .. })
        );
        assert_matches!(
            entry_id("<entry><id>http://example.org/feeds/issues</id></entry>"),
            Err(Error::Malformed {
                what: "issue number",
                ..
            })
        );
        assert!(entry_id("Service unavailable").is_err());
    }

    #[test]
    fn entry_escapes_text() {
        let xml = entry(Some("Beams & <slurs>"), "a \"quote\"", "joe", "");
        assert!(xml.contains("<title>Beams &amp; &lt;slurs&gt;</title>"));
        assert!(xml.contains("<author><name>joe</name></author>"));
        assert!(!xml.contains("issues:updates"));
    }

    #[test]
    fn updates_xml() {
        let full = Updates {
            status: Some("Started"),
            owner: Some("joe"),
            labels: &["Patch-new"],
        };
        assert_eq!(
            full.to_xml(),
            "  <issues:updates>\n    <issues:status>Started</issues:status>\n    \
             <issues:ownerUpdate>joe</issues:ownerUpdate>\n    \
             <issues:label>Patch-new</issues:label>\n  </issues:updates>\n"
        );
        assert_eq!(Updates::default().to_xml(), "  <issues:updates/>\n");
    }

    #[test]
    fn create_issue() {
        let mut server = mockito::Server::new();
        let m = server
            .mock("POST", FEED)
            .match_header("authorization", "GoogleLogin auth=secret")
            .match_header("content-type", "application/atom+xml")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("<title>Patch: Beams &amp; slurs</title>".into()),
                Matcher::Regex("<issues:status>Started</issues:status>".into()),
                Matcher::Regex("<issues:username>joe</issues:username>".into()),
                Matcher::Regex("<issues:label>Patch-new</issues:label>".into()),
                Matcher::Regex("<issues:label>Type-Other</issues:label>".into()),
            ]))
            .with_status(201)
            .with_body(CREATED)
            .create();
        let id = hosting(&server.url())
            .create_issue("Beams & slurs", "Please review")
            .unwrap();
        assert_eq!(id, 1234);
        m.assert();
    }

    #[test]
    fn create_rejected_is_fatal() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("POST", FEED)
            .with_status(403)
            .with_body("Token invalid")
            .create();
        let err = hosting(&server.url())
            .create_issue("Beams", "Please review")
            .unwrap_err();
        assert_matches!(
            err,
            super::super::Error::ProjectHosting(Error::Api { status, .. })
                if status == StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn update_issue() {
        let mut server = mockito::Server::new();
        let m = server
            .mock("POST", COMMENTS)
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("<content type=\"text\">Patch set 2</content>".into()),
                Matcher::Regex("<issues:ownerUpdate>joe</issues:ownerUpdate>".into()),
            ]))
            .with_status(201)
            .create();
        assert_eq!(
            hosting(&server.url()).update_issue(1234, "Patch set 2").unwrap(),
            Some(1234)
        );
        m.assert();
    }

    #[test]
    fn permission_denied_retries_comment_only() {
        let mut server = mockito::Server::new();
        let full = server
            .mock("POST", COMMENTS)
            .match_body(Matcher::Regex("<issues:status>".into()))
            .with_status(403)
            .with_body("No permission to edit issue")
            .expect(1)
            .create();
        let comment_only = server
            .mock("POST", COMMENTS)
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("<issues:updates/>".into()),
                Matcher::Regex("Patch set 2".into()),
            ]))
            .with_status(201)
            .expect(1)
            .create();
        assert_eq!(
            hosting(&server.url()).update_issue(1234, "Patch set 2").unwrap(),
            Some(1234)
        );
        full.assert();
        comment_only.assert();
    }

    #[test]
    fn permission_denied_without_comment() {
        let mut server = mockito::Server::new();
        let full = server
            .mock("POST", COMMENTS)
            .with_status(403)
            .with_body("No permission to edit issue")
            .expect(1)
            .create();
        assert_eq!(hosting(&server.url()).update_issue(1234, "  ").unwrap(), None);
        full.assert();
    }

    #[test]
    fn failed_retry_is_not_fatal() {
        let mut server = mockito::Server::new();
        let _full = server
            .mock("POST", COMMENTS)
            .match_body(Matcher::Regex("<issues:status>".into()))
            .with_status(403)
            .with_body("No permission to edit issue")
            .create();
        let _comment_only = server
            .mock("POST", COMMENTS)
            .match_body(Matcher::Regex("<issues:updates/>".into()))
            .with_status(500)
            .create();
        assert_eq!(
            hosting(&server.url()).update_issue(1234, "Patch set 2").unwrap(),
            None
        );
    }

    #[test]
    fn no_updates_performed_is_success() {
        let mut server = mockito::Server::new();
        let m = server
            .mock("POST", COMMENTS)
            .with_status(400)
            .with_body("There were no updates performed.")
            .expect(1)
            .create();
        assert_eq!(
            hosting(&server.url()).update_issue(1234, "Patch set 2").unwrap(),
            Some(1234)
        );
        m.assert();
    }

    #[test]
    fn other_update_errors_return_none() {
        let mut server = mockito::Server::new();
        let m = server
            .mock("POST", COMMENTS)
            .with_status(500)
            .with_body("Backend error")
            .expect(1)
            .create();
        assert_eq!(
            hosting(&server.url()).update_issue(1234, "Patch set 2").unwrap(),
            None
        );
        m.assert();
    }

    #[test]
    fn issue_url_points_to_web_ui() {
        assert_eq!(
            hosting("https://code.google.com/").issue_url(1234),
            "https://code.google.com/p/lilypond/issues/detail?id=1234"
        );
    }
}
