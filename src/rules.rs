//! Pattern-matched policy mapping a job to an upload target, architecture
//! set, and dependency-repository set.

use indexmap::IndexMap;
use regex::Regex;

use crate::config::Config;
use crate::errors::SchedulerError;
use crate::models::{BuildJob, RawJob};

/// Immutable, regex-keyed policy. A job matches iff every attribute named
/// in `regex_map` exists on the job, is non-empty, and is fully matched by
/// the corresponding regex.
pub struct FilterRule {
    pub name: String,
    regex_map: IndexMap<String, Regex>,
    pub upload_repo: String,
    pub archs: Vec<String>,
    pub deps_repos: Vec<String>,
}

impl FilterRule {
    pub fn matches(&self, job: &RawJob) -> bool {
        self.regex_map.iter().all(|(attr, regex)| {
            job.attr(attr)
                .map(|value| !value.is_empty() && regex.is_match(value))
                .unwrap_or(false)
        })
    }

    /// Consumes a `RawJob`, writing this rule's `upload_repo`/`archs`/
    /// `deps_repos` onto it to produce the immutable, post-rule `BuildJob`.
    pub fn apply(&self, job: RawJob) -> BuildJob {
        BuildJob {
            prj_name: job.prj_name,
            version: job.version,
            srctar: job.srctar,
            srchash: job.srchash,
            workdir: job.workdir,
            archs: self.archs.clone(),
            upload_repo: self.upload_repo.clone(),
            deps_repos: self.deps_repos.clone(),
            do_upload: job.do_upload,
            request: job.request,
        }
    }

    /// Constructs the ordered rule set declared in a configuration
    /// document's `rules` section. If none are declared, a single rule
    /// named `default` is synthesized using the sole configured
    /// repository -- it is an error for more than one repository to be
    /// configured with no rules, since the ambiguity can't be resolved.
    pub fn load_rules(config: &Config) -> Result<IndexMap<String, FilterRule>, SchedulerError> {
        let mut rules = IndexMap::new();

        for (name, rule_cfg) in &config.rules {
            let mut regex_map = IndexMap::new();
            for (attr, pattern) in &rule_cfg.patterns {
                // Anchored at compile time rather than checked post hoc with
                // `find`: a leftmost-first match (e.g. pattern `foo|foobar`
                // against "foobar") would otherwise report a short match and
                // make a full-match check built on top of `find` wrongly
                // reject it.
                let regex = Regex::new(&format!(r"\A(?:{})\z", pattern))
                    .map_err(|e| SchedulerError::config(format!("rule {:?}: bad pattern for {:?}: {}", name, attr, e)))?;
                regex_map.insert(attr.clone(), regex);
            }

            let archs = rule_cfg
                .built_architectures
                .clone()
                .unwrap_or_else(|| config.archs_for_repo(&rule_cfg.upload));

            rules.insert(
                name.clone(),
                FilterRule {
                    name: name.clone(),
                    regex_map,
                    upload_repo: rule_cfg.upload.clone(),
                    archs,
                    deps_repos: rule_cfg.dependency_repositories.clone(),
                },
            );
        }

        if rules.is_empty() {
            if config.repositories.len() > 1 {
                return Err(SchedulerError::config(
                    "no rules declared and more than one repository configured",
                ));
            }
            let (repo_name, _) = config
                .repositories
                .iter()
                .next()
                .expect("validate() ensures at least one repository");
            let archs = config.archs_for_repo(repo_name);
            rules.insert(
                "default".to_string(),
                FilterRule {
                    name: "default".to_string(),
                    regex_map: IndexMap::new(),
                    upload_repo: repo_name.clone(),
                    archs,
                    deps_repos: Vec::new(),
                },
            );
        }

        Ok(rules)
    }

    /// The first rule (in insertion order) whose `matches` returns true;
    /// later rules never override the chosen target.
    pub fn first_match<'a>(rules: &'a IndexMap<String, FilterRule>, job: &RawJob) -> Option<&'a FilterRule> {
        rules.values().find(|rule| rule.matches(job))
    }
}
