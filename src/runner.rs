//! Runner identity: FPGA target, capability labels, and name derivation.
//!
//! Runner names are operator-controlled and deterministic in intent
//! (board type, physical location, board identifier) with a random
//! postfix to de-duplicate in case a runner crashes and isn't cleaned up.
//! Re-running the tool after a crash registers the same logical board
//! under a fresh unique name.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RunnerScope;
use crate::error::{Error, Result};

/// FPGA board attached to the runner host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FpgaTarget {
    Zcu104,
    Zcu104Nightly,
    Vck190,
}

impl FpgaTarget {
    /// Board type prefix used in runner names.
    pub fn board_type(self) -> &'static str {
        match self {
            FpgaTarget::Zcu104 | FpgaTarget::Zcu104Nightly => "caliptra-fpga",
            FpgaTarget::Vck190 => "vck190",
        }
    }

    /// Capability labels the platform uses to route jobs to this board.
    ///
    /// Staging runs get a `-staging` postfix on standalone board labels so
    /// production workflows never land on them.
    pub fn labels(self, staging: bool) -> Vec<String> {
        let postfix = if staging { "-staging" } else { "" };
        match self {
            FpgaTarget::Zcu104 => vec!["caliptra-fpga".to_string()],
            FpgaTarget::Zcu104Nightly => vec![
                "caliptra-fpga".to_string(),
                "caliptra-fpga-nightly".to_string(),
            ],
            FpgaTarget::Vck190 => vec![format!("vck190{postfix}")],
        }
    }
}

impl std::str::FromStr for FpgaTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zcu104" => Ok(Self::Zcu104),
            "zcu104-nightly" => Ok(Self::Zcu104Nightly),
            "vck190" => Ok(Self::Vck190),
            _ => Err(format!(
                "Invalid fpga target: '{s}'. Must be one of 'zcu104', 'zcu104-nightly' or 'vck190'."
            )),
        }
    }
}

/// Derive a unique runner name for a board.
///
/// Format: `{board}-{location}-{identifier}-{hex16}-{date}`, e.g.
/// `caliptra-fpga-kir-03-A1B2C3D4E5F60718-2026-08-26`. The 16 random hex
/// characters de-duplicate against stale fleet entries left by crashes.
pub fn derive_runner_name(target: FpgaTarget, identifier: &str, location: &str) -> String {
    let date = Utc::now().date_naive().format("%Y-%m-%d");

    let mut rng = rand::thread_rng();
    let postfix: String = (0..16)
        .map(|_| format!("{:X}", rng.gen_range(0..16u8)))
        .collect();

    format!(
        "{}-{}-{}-{}-{}",
        target.board_type(),
        location,
        identifier,
        postfix,
        date
    )
}

/// Everything the platform needs to allocate a runner identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSpec {
    /// Unique runner name (per fleet)
    pub name: String,

    /// Ordered capability labels
    pub labels: Vec<String>,

    /// Org or repo the runner registers under
    pub scope: RunnerScope,

    /// Runner group the runner joins
    pub runner_group_id: u64,
}

impl RunnerSpec {
    /// Validate the runner spec before it goes anywhere near the network.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("runner name must not be empty"));
        }
        if self.labels.is_empty() {
            return Err(Error::config("runner must have at least one label"));
        }
        if self.scope.account().is_empty() {
            return Err(Error::config("runner scope account must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_per_target() {
        assert_eq!(FpgaTarget::Zcu104.labels(false), vec!["caliptra-fpga"]);
        assert_eq!(
            FpgaTarget::Zcu104Nightly.labels(false),
            vec!["caliptra-fpga", "caliptra-fpga-nightly"]
        );
        assert_eq!(FpgaTarget::Vck190.labels(false), vec!["vck190"]);
        assert_eq!(FpgaTarget::Vck190.labels(true), vec!["vck190-staging"]);
    }

    #[test]
    fn test_target_from_str() {
        assert_eq!("zcu104".parse::<FpgaTarget>(), Ok(FpgaTarget::Zcu104));
        assert_eq!(
            "ZCU104-Nightly".parse::<FpgaTarget>(),
            Ok(FpgaTarget::Zcu104Nightly)
        );
        assert_eq!("vck190".parse::<FpgaTarget>(), Ok(FpgaTarget::Vck190));
        assert!("zcu102".parse::<FpgaTarget>().is_err());
    }

    #[test]
    fn test_runner_name_format() {
        let name = derive_runner_name(FpgaTarget::Zcu104, "07", "kir");
        let parts: Vec<&str> = name.splitn(4, '-').collect();
        assert!(name.starts_with("caliptra-fpga-kir-07-"));
        assert_eq!(parts[0], "caliptra");

        // hex postfix: 16 uppercase hex chars between identifier and date
        let tail = name.strip_prefix("caliptra-fpga-kir-07-").unwrap();
        let (hex, date) = tail.split_at(16);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(date.starts_with('-'));
        assert_eq!(date.len(), 11); // "-YYYY-MM-DD"
    }

    #[test]
    fn test_runner_names_are_unique() {
        let a = derive_runner_name(FpgaTarget::Vck190, "01", "kir");
        let b = derive_runner_name(FpgaTarget::Vck190, "01", "kir");
        assert_ne!(a, b);
    }

    #[test]
    fn test_spec_validation() {
        let spec = RunnerSpec {
            name: "fpga-runner-07".into(),
            labels: vec!["fpga".into(), "caliptra".into()],
            scope: RunnerScope::Organization {
                name: "caliptra-sw".into(),
            },
            runner_group_id: 1,
        };
        assert!(spec.validate().is_ok());

        let mut empty_name = spec.clone();
        empty_name.name = "  ".into();
        assert!(empty_name.validate().is_err());

        let mut no_labels = spec;
        no_labels.labels.clear();
        assert!(no_labels.validate().is_err());
    }
}
