//! Decides whether an upload files a new tracker issue or updates an existing one.

use crate::resolve::find_issue_id;
use crate::tracker::Tracker;

use anyhow::{Context, Result};

/// What to do with the tracker for one upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Update(u64),
}

/// Operator interaction needed while reconciling
pub trait Prompter {
    /// Asks whether `issue` is the right tracker issue. Defaults to yes.
    fn confirm_guess(&mut self, issue: u64) -> Result<bool>;

    /// Asks for an issue number. An empty answer means "file a new issue".
    fn ask_issue(&mut self) -> Result<String>;

    /// Reports an answer to [`Prompter::ask_issue`] which was neither empty nor a valid issue
    /// number
    fn invalid(&mut self, answer: &str);
}

/// `Some(None)` for blank input, `Some(Some(n))` for a positive number, `None` otherwise
fn parse_answer(answer: &str) -> Option<Option<u64>> {
    let answer = answer.trim();
    if answer.is_empty() {
        return Some(None);
    }
    match answer.trim_start_matches('#').parse() {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(Some(n)),
    }
}

/// Turns an optional guess plus operator answers into an [`Action`]
pub fn decide(guess: Option<u64>, prompter: &mut dyn Prompter) -> Result<Action> {
    if let Some(issue) = guess {
        if prompter.confirm_guess(issue)? {
            return Ok(Action::Update(issue));
        }
    }
    loop {
        let answer = prompter.ask_issue()?;
        match parse_answer(&answer) {
            Some(None) => return Ok(Action::Create),
            Some(Some(n)) => return Ok(Action::Update(n)),
            None => prompter.invalid(&answer),
        }
    }
}

/// Patch upload as presented to the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub subject: String,
    pub description: String,
    /// Code review page of this patch
    pub review_url: Option<String>,
}

impl Upload {
    pub fn new<S: Into<String>>(subject: Option<S>, description: S, review_url: Option<String>) -> Self {
        let subject = subject
            .map(Into::into)
            .filter(|s: &String| !s.trim().is_empty())
            .unwrap_or_else(|| "new patch".to_owned());
        Self {
            subject,
            description: description.into(),
            review_url,
        }
    }

    /// Description followed by the review URL
    pub fn tracker_text(&self) -> String {
        match &self.review_url {
            Some(url) if self.description.is_empty() => url.clone(),
            Some(url) => format!("{}\n\n{}", self.description, url),
            None => self.description.clone(),
        }
    }

    /// Issue number mentioned in subject or description
    pub fn guess(&self) -> Option<u64> {
        find_issue_id(&format!("{}\n{}", self.subject, self.description))
    }
}

/// Carries out `action`. Returns the issue number, or `None` if the tracker refused an update
/// for a non-fatal reason.
pub fn apply(action: Action, upload: &Upload, tracker: &dyn Tracker) -> Result<Option<u64>> {
    let text = upload.tracker_text();
    match action {
        Action::Create => tracker
            .create_issue(&upload.subject, &text)
            .map(Some)
            .with_context(|| format!("Failed to create {} issue", tracker.name())),
        Action::Update(id) => tracker
            .update_issue(id, &text)
            .with_context(|| format!("Failed to update {} issue {}", tracker.name(), id)),
    }
}

/// Guesses the issue from the upload, lets the operator confirm or correct it, then creates or
/// updates the tracker issue
pub fn reconcile(
    upload: &Upload,
    tracker: &dyn Tracker,
    prompter: &mut dyn Prompter,
) -> Result<Option<u64>> {
    let guess = upload.guess();
    debug!("Issue guess: {:?}", guess);
    let action = decide(guess, prompter)?;
    apply(action, upload, tracker)
}
