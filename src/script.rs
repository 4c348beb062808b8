//! Install dialogue scripts and installer profiles.
//!
//! A script is the ordered prompt/response dialogue driven over the
//! console once the installer is running. The profile holds everything
//! around the dialogue: how to log in, how to launch the installer, and
//! what marks completion. Both have Alpine defaults and can be loaded
//! from one TOML document.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serde adapter storing a `Duration` as whole seconds.
pub(crate) mod secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Problems with a script document.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("read script: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse script: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("encode script: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("script has no steps")]
    Empty,
    #[error("step {index} has an empty expect pattern")]
    BlankPattern { index: usize },
}

/// One prompt/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Text that must appear on the console. Matched as a plain
    /// substring against escape-stripped output.
    pub expect: String,
    /// Line typed once the prompt is seen. Empty sends a bare Enter.
    pub response: String,
    /// How long this prompt may take to appear.
    #[serde(
        rename = "timeout_secs",
        with = "secs",
        default = "default_step_timeout"
    )]
    pub timeout: Duration,
}

impl Step {
    pub fn new(expect: impl Into<String>, response: impl Into<String>, timeout: Duration) -> Self {
        Self {
            expect: expect.into(),
            response: response.into(),
            timeout,
        }
    }
}

/// Ordered dialogue for one unattended install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallScript {
    steps: Vec<Step>,
}

impl InstallScript {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_steps(self) -> Vec<Step> {
        self.steps
    }
}

/// How to get from a fresh console to a running installer, and how to
/// recognize the end.
///
/// Timings default to what a small text-mode guest needs: half a minute
/// for a getty to appear, five minutes for package install to finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerProfile {
    pub login_prompt: String,
    pub username: String,
    #[serde(rename = "login_timeout_secs", with = "secs")]
    pub login_timeout: Duration,
    pub shell_prompt: String,
    pub installer_command: String,
    #[serde(rename = "shell_timeout_secs", with = "secs")]
    pub shell_timeout: Duration,
    pub completion_marker: String,
    #[serde(rename = "completion_timeout_secs", with = "secs")]
    pub completion_timeout: Duration,
    /// Sent after the completion marker, typically a reboot into the
    /// installed system.
    pub finish_command: String,
    /// Grace period after boot before the first expect.
    #[serde(rename = "boot_settle_secs", with = "secs")]
    pub boot_settle: Duration,
    /// Pause between a response and the next expect, letting slow
    /// installers redraw.
    #[serde(rename = "step_settle_secs", with = "secs")]
    pub step_settle: Duration,
}

impl Default for InstallerProfile {
    fn default() -> Self {
        Self {
            login_prompt: "login:".into(),
            username: "root".into(),
            login_timeout: Duration::from_secs(30),
            shell_prompt: "localhost:~#".into(),
            installer_command: "setup-alpine".into(),
            shell_timeout: Duration::from_secs(10),
            completion_marker: "Installation is complete".into(),
            completion_timeout: Duration::from_secs(300),
            finish_command: "reboot".into(),
            boot_settle: Duration::from_secs(10),
            step_settle: Duration::from_secs(1),
        }
    }
}

impl InstallerProfile {
    /// Upper bound on console waiting for one full install run. The
    /// orchestrator turns this plus some slack into the per-VM budget.
    pub fn wait_budget(&self, script: &InstallScript) -> Duration {
        let step_waits: Duration = script.steps().iter().map(|s| s.timeout).sum();
        self.boot_settle
            + self.login_timeout
            + self.shell_timeout
            + step_waits
            + self.step_settle * script.len() as u32
            + self.completion_timeout
    }
}

/// Answers for the interactive `setup-alpine` dialogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlpineSetup {
    pub hostname: String,
    pub keymap: String,
    /// Disk mode as setup-alpine understands it: `sys`, `data`, ...
    pub disk_mode: String,
    pub root_password: String,
}

impl Default for AlpineSetup {
    fn default() -> Self {
        Self {
            hostname: "alpine".into(),
            keymap: "us".into(),
            disk_mode: "sys".into(),
            root_password: "alpine123".into(),
        }
    }
}

impl AlpineSetup {
    /// The full setup-alpine question sequence, in the order the
    /// installer asks. Prompts are stable fragments of the real
    /// questions, so minor wording drift between releases still
    /// matches.
    pub fn script(&self) -> InstallScript {
        let t = Duration::from_secs(30);
        InstallScript::new(vec![
            Step::new("Select keyboard layout", self.keymap.as_str(), t),
            Step::new("Select variant", self.keymap.as_str(), t),
            Step::new("Enter system hostname", self.hostname.as_str(), t),
            Step::new("Which one do you want to initialize", "eth0", t),
            Step::new("Ip address for eth0", "dhcp", t),
            Step::new("Do you want to do any manual network configuration", "n", t),
            Step::new("New password", self.root_password.as_str(), t),
            Step::new("Retype password", self.root_password.as_str(), t),
            Step::new("Which timezone", "UTC", t),
            Step::new("HTTP/FTP proxy URL", "none", t),
            Step::new("Which NTP client to run", "chrony", t),
            Step::new("Which SSH server", "openssh", t),
            Step::new("Which disk(s) would you like to use", "vda", t),
            Step::new("How would you like to use it", self.disk_mode.as_str(), t),
            Step::new("WARNING: Erase the above disk(s) and continue", "y", t),
        ])
    }
}

/// On-disk form of a dialogue: an optional `[profile]` table plus
/// `[[step]]` entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptFile {
    #[serde(default)]
    pub profile: InstallerProfile,
    #[serde(rename = "step", default)]
    pub steps: Vec<Step>,
}

impl ScriptFile {
    /// Built-in Alpine dialogue with the default profile.
    pub fn alpine(setup: &AlpineSetup) -> Self {
        Self {
            profile: InstallerProfile::default(),
            steps: setup.script().into_steps(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Self, ScriptError> {
        let file: Self = toml::from_str(text)?;
        file.validate()?;
        Ok(file)
    }

    pub fn to_toml(&self) -> Result<String, ScriptError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn into_parts(self) -> (InstallScript, InstallerProfile) {
        (InstallScript::new(self.steps), self.profile)
    }

    fn validate(&self) -> Result<(), ScriptError> {
        if self.steps.is_empty() {
            return Err(ScriptError::Empty);
        }
        for (index, step) in self.steps.iter().enumerate() {
            if step.expect.trim().is_empty() {
                return Err(ScriptError::BlankPattern { index });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dialogue_walks_setup_alpine_in_order() {
        let script = AlpineSetup::default().script();
        assert_eq!(script.len(), 15);
        let steps = script.steps();
        assert_eq!(steps[0].expect, "Select keyboard layout");
        assert_eq!(steps[0].response, "us");
        assert_eq!(steps[6].expect, "New password");
        assert_eq!(steps[6].response, "alpine123");
        assert!(steps[14].expect.contains("Erase the above disk"));
        assert_eq!(steps[14].response, "y");
    }

    #[test]
    fn custom_answers_flow_into_the_dialogue() {
        let setup = AlpineSetup {
            hostname: "node7".into(),
            keymap: "de".into(),
            disk_mode: "data".into(),
            root_password: "s3cret".into(),
        };
        let script = setup.script();
        let steps = script.steps();
        assert_eq!(steps[1].response, "de");
        assert_eq!(steps[2].response, "node7");
        assert_eq!(steps[13].response, "data");
    }

    #[test]
    fn parses_profile_and_steps_from_one_document() {
        let doc = r#"
            [profile]
            completion_timeout_secs = 600
            username = "admin"

            [[step]]
            expect = "Select keyboard layout"
            response = "us"
            timeout_secs = 45

            [[step]]
            expect = "Which disk"
            response = "vda"
        "#;
        let (script, profile) = ScriptFile::parse(doc).unwrap().into_parts();
        assert_eq!(profile.completion_timeout, Duration::from_secs(600));
        assert_eq!(profile.username, "admin");
        // Everything not overridden keeps its default.
        assert_eq!(profile.installer_command, "setup-alpine");
        assert_eq!(script.len(), 2);
        assert_eq!(script.steps()[0].timeout, Duration::from_secs(45));
        assert_eq!(script.steps()[1].timeout, Duration::from_secs(30));
    }

    #[test]
    fn dumped_builtin_script_parses_back() {
        let file = ScriptFile::alpine(&AlpineSetup::default());
        let parsed = ScriptFile::parse(&file.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, file);
    }

    #[test]
    fn rejects_scripts_without_steps() {
        let err = ScriptFile::parse("[profile]\nusername = \"root\"\n").unwrap_err();
        assert!(matches!(err, ScriptError::Empty));
    }

    #[test]
    fn rejects_blank_expect_patterns() {
        let doc = r#"
            [[step]]
            expect = "  "
            response = "x"
        "#;
        let err = ScriptFile::parse(doc).unwrap_err();
        assert!(matches!(err, ScriptError::BlankPattern { index: 0 }));
    }

    #[test]
    fn wait_budget_covers_every_phase() {
        let profile = InstallerProfile::default();
        let script = InstallScript::new(vec![
            Step::new("a", "1", Duration::from_secs(30)),
            Step::new("b", "2", Duration::from_secs(30)),
        ]);
        // settle 10 + login 30 + shell 10 + steps 60 + 2x1 settle + completion 300
        assert_eq!(profile.wait_budget(&script), Duration::from_secs(412));
    }
}
