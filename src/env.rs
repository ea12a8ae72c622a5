//! Scoped shell variables.
//!
//! Scopes stack: the bottom node is the process-global scope and never
//! pops. A node with `new_scope` set (a function-call frame) hides every
//! outer non-global scope, which is what makes function variables local.
//! Array values store their elements joined by [`ARRAY_SEP`]; the exported
//! view converts the separator to `:` so list variables like PATH survive
//! the trip through `environ` in both directions.

use std::collections::HashMap;

/// Internal separator between array elements.
pub const ARRAY_SEP: char = '\u{1e}';

/// Where a `set` should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Wherever the variable already exists, else the innermost scope.
    Default,
    Local,
    Global,
}

#[derive(Debug, Clone)]
pub struct VarEntry {
    pub value: String,
    pub exported: bool,
}

#[derive(Debug, Default)]
struct EnvNode {
    vars: HashMap<String, VarEntry>,
    new_scope: bool,
}

impl EnvNode {
    fn exports_anything(&self) -> bool {
        self.vars.values().any(|entry| entry.exported)
    }
}

pub struct EnvStack {
    /// `nodes[0]` is the global scope.
    nodes: Vec<EnvNode>,
    /// Set whenever the exported view may have changed; consumed by the
    /// export-array cache.
    changed: bool,
}

impl Default for EnvStack {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvStack {
    pub fn new() -> Self {
        EnvStack {
            nodes: vec![EnvNode::default()],
            changed: true,
        }
    }

    /// Import the inherited environment into the global scope, exported,
    /// with `:` converted to the internal array separator.
    pub fn import_environ(&mut self) {
        for (key, value) in std::env::vars() {
            let converted: String = value
                .chars()
                .map(|c| if c == ':' { ARRAY_SEP } else { c })
                .collect();
            self.nodes[0].vars.insert(
                key,
                VarEntry {
                    value: converted,
                    exported: true,
                },
            );
        }
        self.changed = true;
    }

    /// Scope indices visible from the top of the stack, innermost first.
    /// A `new_scope` node hides everything below it except the global node.
    fn visible_indices(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for idx in (1..self.nodes.len()).rev() {
            out.push(idx);
            if self.nodes[idx].new_scope {
                break;
            }
        }
        out.push(0);
        out
    }

    pub fn get(&self, name: &str) -> Option<&VarEntry> {
        for idx in self.visible_indices() {
            if let Some(entry) = self.nodes[idx].vars.get(name) {
                return Some(entry);
            }
        }
        None
    }

    /// Set a variable. `export` of `None` keeps the existing export flag
    /// (false for a fresh variable).
    pub fn set(&mut self, name: &str, value: &str, scope: Scope, export: Option<bool>) {
        let target = match scope {
            Scope::Global => 0,
            Scope::Local => self.nodes.len() - 1,
            Scope::Default => self
                .visible_indices()
                .into_iter()
                .find(|&idx| self.nodes[idx].vars.contains_key(name))
                .unwrap_or(self.nodes.len() - 1),
        };
        let node = &mut self.nodes[target];
        let previous_export = node
            .vars
            .get(name)
            .map(|entry| entry.exported)
            .unwrap_or(false);
        let exported = export.unwrap_or(previous_export);
        node.vars.insert(
            name.to_string(),
            VarEntry {
                value: value.to_string(),
                exported,
            },
        );
        if exported || previous_export {
            self.changed = true;
        }
    }

    /// Remove the first visible occurrence. Returns whether anything was
    /// removed.
    pub fn remove(&mut self, name: &str) -> bool {
        for idx in self.visible_indices() {
            if let Some(entry) = self.nodes[idx].vars.remove(name) {
                if entry.exported {
                    self.changed = true;
                }
                return true;
            }
        }
        false
    }

    pub fn push(&mut self, new_scope: bool) {
        self.nodes.push(EnvNode {
            vars: HashMap::new(),
            new_scope,
        });
    }

    pub fn pop(&mut self) {
        if self.nodes.len() == 1 {
            // The global scope never pops.
            return;
        }
        let node = self.nodes.pop().unwrap();
        if node.exports_anything() || node.new_scope {
            self.changed = true;
        }
    }

    pub fn depth(&self) -> usize {
        self.nodes.len()
    }

    /// All visible variable names, innermost definition winning.
    pub fn names(&self) -> Vec<String> {
        let mut seen = HashMap::new();
        for idx in self.visible_indices() {
            for name in self.nodes[idx].vars.keys() {
                seen.entry(name.clone()).or_insert(());
            }
        }
        let mut out: Vec<String> = seen.into_keys().collect();
        out.sort();
        out
    }

    /// Exported `(name, value)` pairs in the merged visible view, with the
    /// array separator converted back to `:`.
    pub fn export_pairs(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        let mut seen: HashMap<&str, ()> = HashMap::new();
        for idx in self.visible_indices() {
            for (name, entry) in &self.nodes[idx].vars {
                if seen.contains_key(name.as_str()) {
                    continue;
                }
                seen.insert(name, ());
                if entry.exported {
                    let value: String = entry
                        .value
                        .chars()
                        .map(|c| if c == ARRAY_SEP { ':' } else { c })
                        .collect();
                    out.push((name.clone(), value));
                }
            }
        }
        out
    }

    /// Whether the exported view changed since the last call.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }
}

/// Join array elements into a stored value.
pub fn join_array(elements: &[String]) -> String {
    elements.join(&ARRAY_SEP.to_string())
}

/// Split a stored value into array elements.
pub fn split_array(value: &str) -> Vec<String> {
    value.split(ARRAY_SEP).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_updates_existing_scope() {
        let mut env = EnvStack::new();
        env.set("color", "red", Scope::Global, None);
        env.push(false);
        env.set("color", "blue", Scope::Default, None);
        env.pop();
        assert_eq!(env.get("color").unwrap().value, "blue");
    }

    #[test]
    fn local_set_dies_with_its_scope() {
        let mut env = EnvStack::new();
        env.push(false);
        env.set("tmp", "1", Scope::Local, None);
        assert!(env.get("tmp").is_some());
        env.pop();
        assert!(env.get("tmp").is_none());
    }

    #[test]
    fn new_scope_hides_outer_locals_but_not_globals() {
        let mut env = EnvStack::new();
        env.set("global_var", "g", Scope::Global, None);
        env.push(false);
        env.set("outer_local", "o", Scope::Local, None);
        env.push(true); // function-call frame
        assert!(env.get("outer_local").is_none());
        assert_eq!(env.get("global_var").unwrap().value, "g");
        env.pop();
        assert_eq!(env.get("outer_local").unwrap().value, "o");
    }

    #[test]
    fn export_pairs_convert_separator_to_colon() {
        let mut env = EnvStack::new();
        let path = join_array(&["/usr/bin".into(), "/bin".into()]);
        env.set("PATH", &path, Scope::Global, Some(true));
        let pairs = env.export_pairs();
        let path_pair = pairs.iter().find(|(k, _)| k == "PATH").unwrap();
        assert_eq!(path_pair.1, "/usr/bin:/bin");
    }

    #[test]
    fn unexported_vars_stay_out_of_export_view() {
        let mut env = EnvStack::new();
        env.set("secret", "x", Scope::Global, Some(false));
        assert!(env.export_pairs().iter().all(|(k, _)| k != "secret"));
    }

    #[test]
    fn change_flag_tracks_export_relevant_mutations() {
        let mut env = EnvStack::new();
        assert!(env.take_changed());
        env.set("plain", "1", Scope::Global, None);
        assert!(!env.take_changed());
        env.set("shown", "1", Scope::Global, Some(true));
        assert!(env.take_changed());
        env.set("shown", "2", Scope::Default, None);
        assert!(env.take_changed());
        env.remove("shown");
        assert!(env.take_changed());
    }

    #[test]
    fn popping_an_exporting_scope_dirties_the_cache() {
        let mut env = EnvStack::new();
        env.push(false);
        env.set("tmp", "1", Scope::Local, Some(true));
        env.take_changed();
        env.pop();
        assert!(env.take_changed());
    }

    #[test]
    fn array_round_trip() {
        let elements = vec!["a".to_string(), "b c".to_string(), "d".to_string()];
        assert_eq!(split_array(&join_array(&elements)), elements);
    }
}
