#[macro_use]
extern crate log;

mod changelist;
mod prompt;
mod reconcile;
mod resolve;
mod settings;
mod tracker;

use crate::changelist::Changelist;
use crate::prompt::Console;
use crate::reconcile::{Action, Upload};
use crate::settings::{GitConfig, Settings};
use crate::tracker::Tracker;

use anyhow::{bail, Context, Error};
use colored::*;
use env_logger::Env;
use std::io::stdout;
use std::str::FromStr;
use std::time::Duration;
use structopt::StructOpt;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    Allura,
    ProjectHosting,
}

impl FromStr for TrackerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allura" => Ok(TrackerKind::Allura),
            "projecthosting" | "project-hosting" => Ok(TrackerKind::ProjectHosting),
            _ => bail!(
                "Unknown tracker `{}' (expected `allura' or `projecthosting')",
                s
            ),
        }
    }
}

/// Tracker issue given on the command line. Zero is never a valid issue.
fn issue_number(s: &str) -> Result<u64, String> {
    match s.trim_start_matches('#').parse() {
        Ok(0) => Err("issue numbers start at 1".to_owned()),
        Ok(n) => Ok(n),
        Err(e) => Err(format!("`{}' is not an issue number: {}", s, e)),
    }
}

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    rename_all = "kebab",
    after_help = "\
    Set RUST_LOG=cl_tracker=debug in the environment to get full logging output.
    "
)]
pub struct Opt {
    /// Issue tracker to talk to: `allura' or `projecthosting'
    #[structopt(
        short,
        long,
        global = true,
        default_value = "allura",
        value_name = "TRACKER"
    )]
    tracker: TrackerKind,
    /// Allura access token
    ///
    /// Overrides the `allura.token' setting. Alternatively set the ALLURA_TOKEN environment
    /// variable.
    #[structopt(long, global = true, env = "ALLURA_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Branch to work on [default: current branch]
    #[structopt(short, long, global = true, value_name = "BRANCH")]
    branch: Option<String>,
    /// HTTP request timeout
    #[structopt(long, global = true, default_value = "30", value_name = "SECS")]
    timeout: u64,
    #[structopt(subcommand)]
    command: Cmd,
}

#[derive(Debug, Clone, StructOpt)]
pub enum Cmd {
    /// Links a code review upload to a tracker issue, creating or updating the issue.
    Upload(UploadOpt),
    /// Files a new tracker issue and links it to the branch.
    Create {
        /// Issue summary
        subject: String,
        /// Issue description
        #[structopt(default_value = "")]
        description: String,
    },
    /// Adds a note to a tracker issue and links it to the branch.
    Update {
        #[structopt(value_name = "ISSUE", parse(try_from_str = issue_number))]
        issue: u64,
        /// Note to add
        #[structopt(default_value = "")]
        description: String,
    },
    /// Shows the tracker issue linked to the branch, or links another one (0 unlinks).
    Issue {
        #[structopt(value_name = "N")]
        issue: Option<u64>,
    },
    /// Writes tracker and code review settings to git config.
    Config(ConfigOpt),
}

#[derive(Debug, Clone, StructOpt, Default)]
pub struct UploadOpt {
    /// Patch subject [default: "new patch"]
    #[structopt(short, long)]
    subject: Option<String>,
    /// Patch description [default: fetched from the code review server]
    #[structopt(short = "m", long, default_value = "")]
    message: String,
    /// Code review issue the patch was uploaded to
    #[structopt(short, long, value_name = "N")]
    review_issue: Option<u64>,
    /// Patchset number on the code review server
    #[structopt(short, long, value_name = "N")]
    patchset: Option<u64>,
    /// Update this tracker issue without asking
    #[structopt(short, long, value_name = "N", parse(try_from_str = issue_number))]
    issue: Option<u64>,
    /// Always file a new tracker issue
    #[structopt(long, conflicts_with = "issue")]
    new: bool,
}

#[derive(Debug, Clone, StructOpt, Default)]
pub struct ConfigOpt {
    /// Allura ticket tracker, e.g. https://sourceforge.net/p/PROJECT/issues/
    #[structopt(long, value_name = "URL")]
    tracker_server: Option<String>,
    /// Allura bearer token
    #[structopt(long, value_name = "TOKEN")]
    allura_token: Option<String>,
    /// Code review server host name
    #[structopt(long, value_name = "HOST")]
    review_server: Option<String>,
    /// Addresses to CC on code reviews
    #[structopt(long, value_name = "LIST")]
    cc: Option<String>,
    /// Project hosting project name
    #[structopt(long, value_name = "NAME")]
    project: Option<String>,
    /// Project hosting user name
    #[structopt(long, value_name = "NAME")]
    user: Option<String>,
    /// Project hosting auth token
    #[structopt(long, value_name = "TOKEN")]
    hosting_token: Option<String>,
    /// Project hosting server
    #[structopt(long, value_name = "URL")]
    hosting_server: Option<String>,
}

impl ConfigOpt {
    fn settings(&self) -> Settings {
        Settings {
            tracker_server: self.tracker_server.clone(),
            token: self.allura_token.clone(),
            review_server: self.review_server.clone(),
            cc: self.cc.clone(),
            project: self.project.clone(),
            user: self.user.clone(),
            hosting_token: self.hosting_token.clone(),
            hosting_server: self.hosting_server.clone(),
        }
    }
}

/// Repository config plus the branch to work on. Migrates old-style mappings on the way.
fn open_repo(opt: &Opt) -> Result<(GitConfig, String)> {
    let mut store = GitConfig::discover(".").context("Not inside a git repository")?;
    let git_dir = store.git_dir().to_owned();
    let n = changelist::migrate_legacy_mapping(&git_dir, &mut store)?;
    if n > 0 {
        info!("Migrated {} branch mapping(s) into git config", n);
    }
    let branch = match &opt.branch {
        Some(b) => b.clone(),
        None => store.current_branch()?,
    };
    Ok((store, branch))
}

/// Settings from git config, overridden by command line options
fn load_settings(opt: &Opt, store: &GitConfig) -> Result<Settings> {
    let cli = Settings {
        token: opt.token.clone(),
        ..Settings::default()
    };
    Ok(cli.or(Settings::load(store)?))
}

fn create_tracker(opt: &Opt, settings: &Settings) -> Result<Box<dyn Tracker>> {
    let timeout = Duration::from_secs(opt.timeout);
    let tracker: Box<dyn Tracker> = match opt.tracker {
        TrackerKind::Allura => Box::new(tracker::Allura::new(
            settings.tracker_server()?,
            settings.token()?,
            timeout,
        )?),
        TrackerKind::ProjectHosting => Box::new(tracker::ProjectHosting::new(
            settings.hosting_server(),
            settings.project()?,
            settings.user()?,
            settings.hosting_token()?,
            timeout,
        )?),
    };
    debug!("Using {} tracker", tracker.name());
    Ok(tracker)
}

/// Action fixed by options or an existing branch link, if any
fn preset_action(new: bool, issue: Option<u64>) -> Option<Action> {
    match (new, issue) {
        (true, _) => Some(Action::Create),
        (false, Some(id)) => Some(Action::Update(id)),
        (false, None) => None,
    }
}

/// Links the outcome of a tracker operation to the branch
fn record(cl: &mut Changelist, res: Option<u64>, tracker: &dyn Tracker) -> Result<()> {
    match res {
        Some(id) => {
            cl.set_tracker_issue(id)?;
            info!(
                "{}: tracker issue {}",
                cl.branch().green(),
                tracker.issue_url(id).green()
            );
        }
        None => warn!(
            "{}: tracker issue not updated, branch link left unchanged",
            cl.branch().yellow()
        ),
    }
    Ok(())
}

/// Description given on the command line, or else the one entered during code review
fn upload_description(
    message: &str,
    review_url: Option<&str>,
    timeout: Duration,
) -> Result<String> {
    match review_url {
        Some(url) if message.trim().is_empty() => changelist::fetch_description(url, timeout),
        _ => Ok(message.to_owned()),
    }
}

fn upload(opt: &Opt, u_opt: &UploadOpt) -> Result<()> {
    let (mut store, branch) = open_repo(opt)?;
    let settings = load_settings(opt, &store)?;
    let tracker = create_tracker(opt, &settings)?;
    let mut cl = Changelist::new(&mut store, &branch);
    if let Some(issue) = u_opt.review_issue {
        cl.set_review_issue(issue)?;
    }
    if let Some(patchset) = u_opt.patchset {
        cl.set_patchset(patchset)?;
    }
    let review_url = match (cl.review_issue()?, settings.review_server.as_deref()) {
        (Some(issue), Some(server)) => Some(changelist::review_url(server, issue)),
        (Some(issue), None) => {
            warn!(
                "Setting `{}' missing, not linking code review issue {}",
                settings::REVIEW_SERVER,
                issue
            );
            None
        }
        (None, _) => None,
    };
    let description = upload_description(
        &u_opt.message,
        review_url.as_deref(),
        Duration::from_secs(opt.timeout),
    )?;
    let upload = Upload::new(u_opt.subject.clone(), description, review_url);
    let linked = match u_opt.issue {
        Some(id) => Some(id),
        None => cl.tracker_issue()?,
    };
    let res = match preset_action(u_opt.new, linked) {
        Some(action) => reconcile::apply(action, &upload, tracker.as_ref())?,
        None => reconcile::reconcile(&upload, tracker.as_ref(), &mut Console)?,
    };
    record(&mut cl, res, tracker.as_ref())
}

fn create(opt: &Opt, subject: &str, description: &str) -> Result<()> {
    let (mut store, branch) = open_repo(opt)?;
    let settings = load_settings(opt, &store)?;
    let tracker = create_tracker(opt, &settings)?;
    let upload = Upload::new(Some(subject), description, None);
    let res = reconcile::apply(Action::Create, &upload, tracker.as_ref())?;
    record(
        &mut Changelist::new(&mut store, &branch),
        res,
        tracker.as_ref(),
    )
}

fn update(opt: &Opt, issue: u64, description: &str) -> Result<()> {
    let (mut store, branch) = open_repo(opt)?;
    let settings = load_settings(opt, &store)?;
    let tracker = create_tracker(opt, &settings)?;
    let upload = Upload::new(None, description, None);
    let res = reconcile::apply(Action::Update(issue), &upload, tracker.as_ref())?;
    record(
        &mut Changelist::new(&mut store, &branch),
        res,
        tracker.as_ref(),
    )
}

fn issue(opt: &Opt, issue: Option<u64>) -> Result<()> {
    let (mut store, branch) = open_repo(opt)?;
    let settings = load_settings(opt, &store)?;
    let mut cl = Changelist::new(&mut store, &branch);
    if let Some(n) = issue {
        cl.set_tracker_issue(n)?;
    }
    match cl.tracker_issue()? {
        Some(n) => {
            // the URL is a nicety; don't insist on a complete tracker setup for it
            let url = create_tracker(opt, &settings)
                .map(|t| t.issue_url(n))
                .unwrap_or_default();
            println!("{}: tracker issue {} {}", cl.branch().green(), n, url);
        }
        None => println!("{}: no tracker issue", cl.branch().green()),
    }
    if let Some(review) = cl.review_issue()? {
        let patchset = cl
            .patchset()?
            .map(|p| format!(" (patchset {})", p))
            .unwrap_or_default();
        println!("{}: code review issue {}{}", cl.branch().green(), review, patchset);
    }
    Ok(())
}

fn config(c_opt: &ConfigOpt) -> Result<()> {
    let mut store = GitConfig::discover(".").context("Not inside a git repository")?;
    let mut new = c_opt.settings();
    if new == Settings::default() {
        new = prompt::ask_settings(&Settings::load(&store)?)?;
    }
    if let Some(server) = &new.tracker_server {
        tracker::allura_api_url(server)?;
    }
    new.save(&mut store)?;
    serde_json::to_writer_pretty(stdout().lock(), &Settings::load(&store)?)
        .context("broken pipe")?;
    println!();
    Ok(())
}

fn run() -> Result<()> {
    dotenv::dotenv().ok();
    let opt = Opt::from_args();
    match opt.command {
        Cmd::Upload(ref u) => upload(&opt, u),
        Cmd::Create {
            ref subject,
            ref description,
        } => create(&opt, subject, description),
        Cmd::Update {
            issue: id,
            ref description,
        } => update(&opt, id, description),
        Cmd::Issue { issue: n } => issue(&opt, n),
        Cmd::Config(ref c) => config(c),
    }
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        for e in err.chain() {
            error!("{}", e);
            // reqwest seems to fold all causes into its head error
            if e.downcast_ref::<reqwest::Error>().is_some() {
                break;
            }
        }
        std::process::exit(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn tracker_kinds() {
        assert_eq!(
            "allura".parse::<TrackerKind>().unwrap(),
            TrackerKind::Allura
        );
        assert_eq!(
            "projecthosting".parse::<TrackerKind>().unwrap(),
            TrackerKind::ProjectHosting
        );
        assert!("github".parse::<TrackerKind>().is_err());
    }

    #[test]
    fn parse_upload() {
        let opt = Opt::from_iter_safe(&[
            "cl-tracker", "upload", "-s", "Beams", "-m", "Fix 12", "-r", "5678", "-p", "2",
        ])
        .unwrap();
        assert_eq!(opt.tracker, TrackerKind::Allura);
        assert_eq!(opt.timeout, 30);
        assert_matches!(
            opt.command,
            Cmd::Upload(UploadOpt {
                subject: Some(ref s),
                review_issue: Some(5678),
                patchset: Some(2),
                issue: None,
                new: false,
                ..
            }) if s == "Beams"
        );
    }

    #[test]
    fn global_options_after_subcommand() {
        let opt = Opt::from_iter_safe(&[
            "cl-tracker",
            "issue",
            "--tracker",
            "projecthosting",
            "-b",
            "beams",
        ])
        .unwrap();
        assert_eq!(opt.tracker, TrackerKind::ProjectHosting);
        assert_eq!(opt.branch.as_deref(), Some("beams"));
        assert_matches!(opt.command, Cmd::Issue { issue: None });
    }

    #[test]
    fn new_conflicts_with_issue() {
        assert!(Opt::from_iter_safe(&["cl-tracker", "upload", "--new", "-i", "3"]).is_err());
    }

    #[test]
    fn zero_is_not_an_issue() {
        assert!(Opt::from_iter_safe(&["cl-tracker", "update", "0"]).is_err());
        assert!(Opt::from_iter_safe(&["cl-tracker", "upload", "-i", "0"]).is_err());
        assert!(Opt::from_iter_safe(&["cl-tracker", "update", "x"]).is_err());
        let opt = Opt::from_iter_safe(&["cl-tracker", "update", "#12", "note"]).unwrap();
        assert_matches!(opt.command, Cmd::Update { issue: 12, .. });
        // `issue 0' unlinks the branch
        let opt = Opt::from_iter_safe(&["cl-tracker", "issue", "0"]).unwrap();
        assert_matches!(opt.command, Cmd::Issue { issue: Some(0) });
    }

    #[test]
    fn description_falls_back_to_review_server() {
        let mut server = mockito::Server::new();
        let desc = server
            .mock("GET", "/5678/description")
            .with_body("Fix 45")
            .expect(1)
            .create();
        let review = format!("{}/5678", server.url());
        let timeout = Duration::from_secs(5);
        assert_eq!(
            upload_description("", Some(review.as_str()), timeout).unwrap(),
            "Fix 45"
        );
        assert_eq!(
            upload_description("Beams", Some(review.as_str()), timeout).unwrap(),
            "Beams"
        );
        assert_eq!(upload_description("", None, timeout).unwrap(), "");
        desc.assert();
    }

    #[test]
    fn preset_actions() {
        assert_eq!(preset_action(true, Some(3)), Some(Action::Create));
        assert_eq!(preset_action(true, None), Some(Action::Create));
        assert_eq!(preset_action(false, Some(3)), Some(Action::Update(3)));
        assert_eq!(preset_action(false, None), None);
    }

    #[test]
    fn config_options_to_settings() {
        let c = ConfigOpt {
            tracker_server: Some("https://sourceforge.net/p/proj/issues/".into()),
            allura_token: Some("t".into()),
            ..ConfigOpt::default()
        };
        let s = c.settings();
        assert_eq!(s.tracker_server.as_deref(), Some("https://sourceforge.net/p/proj/issues/"));
        assert_eq!(s.token.as_deref(), Some("t"));
        assert_eq!(s.user, None);
    }

    #[test]
    fn allura_needs_config() {
        let opt = Opt::from_iter_safe(&["cl-tracker", "issue"]).unwrap();
        let err = create_tracker(&opt, &Settings::default()).err().unwrap();
        assert!(err.to_string().contains("allura.tracker"));
    }
}
