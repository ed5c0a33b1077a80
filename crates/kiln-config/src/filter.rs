use glob::Pattern;
use kiln_core::{Diagnostic, Diagnostics};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug)]
enum Matcher {
    Glob(Pattern),
    Exact(String),
}

impl Matcher {
    fn matches(&self, name: &str) -> bool {
        match self {
            Matcher::Glob(p) => p.matches(name),
            Matcher::Exact(s) => s == name,
        }
    }
}

/// The `-only` and `-except` command line filters.
#[derive(Clone, Debug, Default)]
pub struct BuildFilter {
    only: Vec<Matcher>,
    except: Vec<Matcher>,
}

fn compile(flag: &str, patterns: &[String], diags: &mut Diagnostics) -> Vec<Matcher> {
    let mut out = Vec::with_capacity(patterns.len());
    for raw in patterns {
        match Pattern::new(raw) {
            Ok(p) => out.push(Matcher::Glob(p)),
            Err(e) => diags.push(Diagnostic::error(format!("Invalid -{flag} pattern {raw}: {e}"))),
        }
    }
    out
}

impl BuildFilter {
    pub fn glob(only: &[String], except: &[String]) -> Result<Self, Diagnostics> {
        let mut diags = Diagnostics::new();
        let only = compile("only", only, &mut diags);
        let except = compile("except", except, &mut diags);
        if diags.has_errors() {
            return Err(diags);
        }
        Ok(Self { only, except })
    }

    pub fn exact(only: &[String], except: &[String]) -> Self {
        Self {
            only: only.iter().cloned().map(Matcher::Exact).collect(),
            except: except.iter().cloned().map(Matcher::Exact).collect(),
        }
    }

    pub fn only_len(&self) -> usize {
        self.only.len()
    }

    pub fn except_len(&self) -> usize {
        self.except.len()
    }

    /// `None` when no `-only` filter was given.
    pub fn matches_only(&self, name: &str) -> Option<bool> {
        if self.only.is_empty() {
            return None;
        }
        Some(self.only.iter().any(|m| m.matches(name)))
    }

    pub fn matches_except(&self, name: &str) -> bool {
        self.except.iter().any(|m| m.matches(name))
    }
}

/// Counts how many builds the command line filters selected so unmatched
/// filters can be reported once every build has been looked at.
#[derive(Debug, Default)]
pub struct FilterTally {
    pub only_matches: usize,
    pub except_matches: usize,
    pub possible_names: Vec<String>,
}

impl FilterTally {
    pub fn skip_build(&mut self, filter: &BuildFilter, name: &str) -> bool {
        self.possible_names.push(name.to_string());
        match filter.matches_only(name) {
            Some(false) => return true,
            Some(true) => self.only_matches += 1,
            None => {}
        }
        if filter.matches_except(name) {
            self.except_matches += 1;
            return true;
        }
        false
    }

    pub fn warnings(&self, filter: &BuildFilter) -> Diagnostics {
        let detail = format!(
            "Possible build names: {:?}.\nThese could also be matched with a glob pattern like: 'null.*'",
            self.possible_names
        );
        let mut diags = Diagnostics::new();
        if filter.only_len() > self.only_matches {
            diags.push(
                Diagnostic::warning("an 'only' option was passed, but not all matches were found for the given build.")
                    .with_detail(detail.clone()),
            );
        }
        if filter.except_len() > self.except_matches {
            diags.push(Diagnostic::warning("an 'except' option was passed, but did not match any build.").with_detail(detail));
        }
        diags
    }
}

/// `only`/`except` lists on a provisioner or post-processor, matched exactly
/// against source names such as `null.ubuntu`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlyExcept {
    #[serde(default)]
    pub only: Vec<String>,
    #[serde(default)]
    pub except: Vec<String>,
}

impl OnlyExcept {
    pub fn skip(&self, name: &str) -> bool {
        let same = |entry: &String| entry.strip_prefix("source.").unwrap_or(entry) == name;
        if !self.only.is_empty() {
            return !self.only.iter().any(same);
        }
        self.except.iter().any(same)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn glob_only_and_except() {
        let f = BuildFilter::glob(&names(&["docker.ubuntu"]), &[]).unwrap();
        assert_eq!(f.matches_only("docker.ubuntu"), Some(true));
        assert_eq!(f.matches_only("docker.alpine"), Some(false));

        let f = BuildFilter::glob(&[], &names(&["docker.*"])).unwrap();
        assert_eq!(f.matches_only("docker.ubuntu"), None);
        assert!(f.matches_except("docker.ubuntu"));
        assert!(!f.matches_except("null.x"));
    }

    #[test]
    fn invalid_patterns_are_errors() {
        let diags = BuildFilter::glob(&names(&["[docker"]), &[]).unwrap_err();
        assert!(diags.has_errors());
        assert!(diags.iter().next().unwrap().summary.starts_with("Invalid -only pattern [docker: "));
    }

    #[test]
    fn exact_filters_do_not_glob() {
        let f = BuildFilter::exact(&names(&["docker.*"]), &[]);
        assert_eq!(f.matches_only("docker.ubuntu"), Some(false));
        assert_eq!(f.matches_only("docker.*"), Some(true));
    }

    #[test]
    fn tally_warns_about_unmatched_filters() {
        let f = BuildFilter::glob(&names(&["web.*", "db.*"]), &names(&["nothing"])).unwrap();
        let mut tally = FilterTally::default();
        assert!(!tally.skip_build(&f, "web.null.a"));
        assert!(tally.skip_build(&f, "cache.null.b"));
        let warnings = tally.warnings(&f);
        assert_eq!(warnings.len(), 2);
        assert!(!warnings.has_errors());
        assert!(warnings.iter().all(|w| w.detail.contains("\"web.null.a\", \"cache.null.b\"")));
    }

    #[test]
    fn block_level_only_except() {
        let oe = OnlyExcept { only: names(&["source.null.a"]), except: vec![] };
        assert!(!oe.skip("null.a"));
        assert!(oe.skip("null.b"));
        let oe = OnlyExcept { only: vec![], except: names(&["null.b"]) };
        assert!(!oe.skip("null.a"));
        assert!(oe.skip("null.b"));
        assert!(!OnlyExcept::default().skip("anything"));
    }
}
