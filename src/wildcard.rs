//! Prompt wildcards.
//!
//! - `~name` picks a random entry from the list `name`
//! - `~~name` walks the list in order, wrapping around
//! - `{a|b|c}` picks one of the inline options at random
//!
//! Sequential counters restart for every prompt, so iteration `i` of a
//! prompt always gets entry `i % len` of a `~~` list.

use crate::error::{Result, WorkerError};
use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::PathBuf;

/// Where wildcard lists come from.
pub trait WildcardSource: Send + Sync {
    /// Entries of list `name`, or `None` if there is no such list.
    fn entries(&self, name: &str) -> anyhow::Result<Option<Vec<String>>>;
}

/// Lists held in memory.
#[derive(Debug, Clone, Default)]
pub struct MapWildcards {
    lists: HashMap<String, Vec<String>>,
}

impl MapWildcards {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_list<I, S>(mut self, name: &str, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lists
            .insert(name.to_string(), entries.into_iter().map(Into::into).collect());
        self
    }
}

impl WildcardSource for MapWildcards {
    fn entries(&self, name: &str) -> anyhow::Result<Option<Vec<String>>> {
        Ok(self.lists.get(name).cloned())
    }
}

/// One `<name>.txt` file per list, one entry per non-blank line.
/// Lines starting with `#` are comments.
#[derive(Debug, Clone)]
pub struct DirectoryWildcards {
    dir: PathBuf,
}

impl DirectoryWildcards {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl WildcardSource for DirectoryWildcards {
    fn entries(&self, name: &str) -> anyhow::Result<Option<Vec<String>>> {
        let path = self.dir.join(format!("{}.txt", name));
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading wildcard list {}", path.display()))?;
        Ok(Some(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect(),
        ))
    }
}

/// Produces one concrete prompt per iteration.
pub trait PromptExpansion: Send {
    fn expand_all(&mut self, prompt: &str, count: usize) -> Result<Vec<String>>;
}

/// Leaves prompts untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWildcards;

impl PromptExpansion for NoWildcards {
    fn expand_all(&mut self, prompt: &str, count: usize) -> Result<Vec<String>> {
        Ok(vec![prompt.to_string(); count])
    }
}

/// Wildcard expander over any [`WildcardSource`].
pub struct WildcardExpander<S: WildcardSource> {
    source: S,
    rng: StdRng,
    cache: HashMap<String, Vec<String>>,
}

impl<S: WildcardSource> WildcardExpander<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            rng: StdRng::from_rng(&mut rand::rng()),
            cache: HashMap::new(),
        }
    }

    /// Reproducible random picks.
    pub fn with_seed(source: S, seed: u64) -> Self {
        Self {
            source,
            rng: StdRng::seed_from_u64(seed),
            cache: HashMap::new(),
        }
    }

    fn list(&mut self, name: &str) -> Result<&Vec<String>> {
        if !self.cache.contains_key(name) {
            let entries = self
                .source
                .entries(name)?
                .ok_or_else(|| WorkerError::config(format!("Unknown wildcard '~{}'", name)))?;
            if entries.is_empty() {
                return Err(WorkerError::config(format!("Wildcard '~{}' has no entries", name)));
            }
            self.cache.insert(name.to_string(), entries);
        }
        self.cache
            .get(name)
            .ok_or_else(|| WorkerError::Other(format!("wildcard cache miss for '{}'", name)))
    }

    fn expand_one(&mut self, prompt: &str, index: usize) -> Result<String> {
        let chars: Vec<char> = prompt.chars().collect();
        let mut out = String::with_capacity(prompt.len());
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '~' => {
                    let sequential = chars.get(i + 1) == Some(&'~');
                    let start = if sequential { i + 2 } else { i + 1 };
                    let end = start
                        + chars[start..]
                            .iter()
                            .take_while(|c| c.is_ascii_alphanumeric() || **c == '_' || **c == '-')
                            .count();

                    if end == start {
                        out.push('~');
                        i += 1;
                        continue;
                    }

                    let name: String = chars[start..end].iter().collect();
                    let pick = if sequential {
                        let list = self.list(&name)?;
                        list[index % list.len()].clone()
                    } else {
                        let len = self.list(&name)?.len();
                        let n = self.rng.random_range(0..len);
                        self.list(&name)?[n].clone()
                    };
                    out.push_str(&pick);
                    i = end;
                }
                '{' => {
                    let close = chars[i + 1..].iter().position(|c| *c == '}').map(|p| i + 1 + p);
                    match close {
                        Some(close) if chars[i + 1..close].contains(&'|') => {
                            let body: String = chars[i + 1..close].iter().collect();
                            let options: Vec<&str> = body.split('|').collect();
                            let n = self.rng.random_range(0..options.len());
                            out.push_str(options[n]);
                            i = close + 1;
                        }
                        _ => {
                            out.push('{');
                            i += 1;
                        }
                    }
                }
                c => {
                    out.push(c);
                    i += 1;
                }
            }
        }

        Ok(out)
    }
}

impl<S: WildcardSource> PromptExpansion for WildcardExpander<S> {
    fn expand_all(&mut self, prompt: &str, count: usize) -> Result<Vec<String>> {
        (0..count).map(|i| self.expand_one(prompt, i)).collect()
    }
}
