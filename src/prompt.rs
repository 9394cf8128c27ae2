//! Terminal prompts

use crate::reconcile::Prompter;
use crate::settings::Settings;

use anyhow::Result;
use colored::*;
use inquire::{Confirm, Password, Text};

/// Asks the operator on the terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct Console;

impl Prompter for Console {
    fn confirm_guess(&mut self, issue: u64) -> Result<bool> {
        let question = format!("Is this patch for tracker issue {}?", issue);
        Ok(Confirm::new(&question).with_default(true).prompt()?)
    }

    fn ask_issue(&mut self) -> Result<String> {
        Ok(Text::new("Tracker issue number:")
            .with_help_message("leave blank to create a new issue")
            .prompt()?)
    }

    fn invalid(&mut self, answer: &str) {
        println!(
            "{} is not a valid issue number. Enter a number or leave blank.",
            answer.trim().red()
        );
    }
}

fn non_empty(s: String) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

/// Interactive setup of the Allura settings. Blank answers keep the current values.
pub fn ask_settings(current: &Settings) -> Result<Settings> {
    let server = Text::new("Allura tracker URL:")
        .with_initial_value(current.tracker_server.as_deref().unwrap_or_default())
        .with_help_message("e.g. https://sourceforge.net/p/PROJECT/issues/")
        .prompt()?;
    let token = Password::new("Allura access token:")
        .without_confirmation()
        .with_help_message("leave blank to keep the current token")
        .prompt()?;
    Ok(Settings {
        tracker_server: non_empty(server),
        token: non_empty(token),
        ..Settings::default()
    })
}
