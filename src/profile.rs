//! The `Profile` capability: template expansion from a profile id to an
//! encoder argv, plus the enqueue-time rules (output layout, filename
//! filtering) a profile contributes to the Job Store's folder walk.
//!
//! This is nominally an external collaborator per the design (§4.6); this
//! deployment ships a small built-in registry so the core has something
//! to enqueue against. The registry carried here is the "multi-profile"
//! version recovered from the original reference implementation — see
//! DESIGN.md for the single-vs-multi-profile resolution.

use crate::error::ProfileError;
use std::collections::HashSet;

/// Enqueue-time metadata contributed by a profile.
#[derive(Debug, Clone)]
pub struct EnqueueRules {
    pub output_subdir: &'static str,
    pub output_pattern: &'static str,
    pub filter_prefix: Option<&'static str>,
    pub mirror_first_subdir: bool,
    pub ignore_proxy_suffix: bool,
}

struct ProfileDef {
    id: &'static str,
    argv_template: &'static [&'static str],
    rules: EnqueueRules,
}

const PROFILES: &[ProfileDef] = &[
    ProfileDef {
        id: "prores_proxy_1280",
        argv_template: &[
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-progress",
            "pipe:1",
            "-i",
            "{input}",
            "-map",
            "0:v:0",
            "-map",
            "0:a?",
            "-vf",
            "scale='if(gt(iw,ih),1280,-2)':'if(gt(ih,iw),1280,-2)'",
            "-c:v",
            "prores_ks",
            "-profile:v",
            "0",
            "-c:a",
            "copy",
            "-f",
            "mov",
            "{output}",
        ],
        rules: EnqueueRules {
            output_subdir: "PROXIES",
            output_pattern: "{stem}_Proxy.mov",
            filter_prefix: None,
            mirror_first_subdir: false,
            ignore_proxy_suffix: false,
        },
    },
    ProfileDef {
        id: "dji_drone_prores_standard",
        argv_template: &[
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-progress",
            "pipe:1",
            "-i",
            "{input}",
            "-map",
            "0:v:0",
            "-map",
            "0:a?",
            "-c:v",
            "prores_ks",
            "-profile:v",
            "2",
            "-c:a",
            "copy",
            "-f",
            "mov",
            "{output}",
        ],
        rules: EnqueueRules {
            output_subdir: "dji_drone_prores_standard",
            output_pattern: "{stem}.mov",
            filter_prefix: Some("DJI_"),
            mirror_first_subdir: true,
            ignore_proxy_suffix: true,
        },
    },
];

fn find(profile_id: &str) -> Result<&'static ProfileDef, ProfileError> {
    PROFILES
        .iter()
        .find(|p| p.id == profile_id)
        .ok_or_else(|| ProfileError::Unknown(profile_id.to_string()))
}

/// Expand `{input}`/`{output}` placeholders in the named profile's argv
/// template. Unknown `profile_id` ⇒ `ProfileError::Unknown`.
pub fn materialize(profile_id: &str, input: &str, output: &str) -> Result<Vec<String>, ProfileError> {
    let def = find(profile_id)?;
    Ok(def
        .argv_template
        .iter()
        .map(|part| part.replace("{input}", input).replace("{output}", output))
        .collect())
}

/// Enqueue-time rules for the named profile.
pub fn enqueue_rules(profile_id: &str) -> Result<EnqueueRules, ProfileError> {
    Ok(find(profile_id)?.rules.clone())
}

/// The set of output subdirectories contributed by every registered
/// profile. The Job Store's enqueue walk skips any directory whose name
/// is in this set, so previously produced outputs are never re-ingested.
pub fn output_subdirs() -> HashSet<&'static str> {
    PROFILES.iter().map(|p| p.rules.output_subdir).collect()
}
