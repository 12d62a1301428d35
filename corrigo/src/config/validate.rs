use std::collections::HashSet;
use tracing::{debug, trace};

use super::{
    Config, ModuleContext, ParsedConfig, ParsedModule, DEFAULT_MIN_POLL_INTERVAL, DEFAULT_TIMEOUT,
};
use crate::Error;

const FORBIDDEN_ID_CHARS: &[char] = &['.', '/', ' '];

/// Yield module ids in an order compatible with the `depends` DAG, using
/// repeated scans: each pass collects every module whose dependencies are
/// already done. A pass that makes no progress means the graph is cyclic.
pub fn dependency_order(modules: &[(String, Vec<String>)]) -> Result<Vec<String>, Error> {
    let mut done: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(modules.len());

    while order.len() < modules.len() {
        let mut progressed = false;
        for (id, depends) in modules {
            if done.contains(id.as_str()) {
                continue;
            }
            if depends.iter().all(|d| done.contains(d.as_str())) {
                let _ = done.insert(id);
                order.push(id.clone());
                progressed = true;
            }
        }
        if !progressed {
            let stuck: Vec<&str> = modules
                .iter()
                .filter(|(id, _)| !done.contains(id.as_str()))
                .map(|(id, _)| id.as_str())
                .collect();
            return Err(Error::DependencyCycle(stuck.join(", ")));
        }
    }
    Ok(order)
}

impl Config {
    /// Validates the configuration: id constraints, registered selectors,
    /// per-module settings schemas, dependency resolution (including cycle
    /// detection, before any I/O), and the submodule/server rules.
    /// Module implementations must be registered before calling validate;
    /// this is done automatically when using [`crate::Runtime`].
    pub fn validate(self) -> Result<ParsedConfig, Error> {
        let mut seen: HashSet<&str> = HashSet::new();
        for spec in &self.modules {
            if spec.id.is_empty() {
                return Err(Error::Validation("module with empty id".into()));
            }
            if spec.id.contains(FORBIDDEN_ID_CHARS) {
                return Err(Error::ForbiddenModuleId(spec.id.clone()));
            }
            if !seen.insert(&spec.id) {
                return Err(Error::DuplicateModuleId(spec.id.clone()));
            }
        }

        let ids: HashSet<&str> = self.modules.iter().map(|m| m.id.as_str()).collect();
        for spec in &self.modules {
            for dep in &spec.depends {
                if !ids.contains(dep.as_str()) {
                    return Err(Error::UnknownDependency {
                        module: spec.id.clone(),
                        depends: dep.clone(),
                    });
                }
            }
            if spec.submodule && spec.servers.is_empty() {
                return Err(Error::SubmoduleWithoutServers(spec.id.clone()));
            }
            if !spec.sources.is_empty()
                && !spec.models.is_empty()
                && spec.sources.len() != spec.models.len()
            {
                return Err(Error::MismatchedSourcesAndModels(spec.id.clone()));
            }
        }

        let graph: Vec<(String, Vec<String>)> = self
            .modules
            .iter()
            .map(|m| (m.id.clone(), m.depends.clone()))
            .collect();
        let order = dependency_order(&graph)?;
        trace!(order = order.join(" "), "dependency order verified");

        let mut modules = Vec::with_capacity(self.modules.len());
        for spec in &self.modules {
            let item = super::get_registered(&spec.module)?;
            item.format.validate(&spec.settings)?;
            trace!(id = spec.id, module = spec.module, "module spec validated");

            modules.push(ParsedModule {
                id: spec.id.clone(),
                enabled: spec.is_enabled(),
                submodule: spec.submodule,
                depends: spec.depends.clone(),
                servers: spec.servers.clone(),
                filter: spec.filter,
                creator: item.creator,
                context: ModuleContext {
                    id: spec.id.clone(),
                    set: spec.set.clone(),
                    class: spec.class.clone(),
                    annotator: spec.annotator.clone().unwrap_or_else(|| spec.id.clone()),
                    models: spec.models.clone(),
                    sources: spec.sources.clone(),
                    settings: spec.settings.clone(),
                },
            });
        }

        let threads = self.threads.unwrap_or_else(num_cpus::get);
        debug!(threads, "configuration is valid");

        Ok(ParsedConfig {
            id: self.id.unwrap_or_else(|| "corrigo".into()),
            root: self.root.unwrap_or_else(|| ".".into()),
            language: self.language,
            tokenizer: self.tokenizer,
            threads,
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            minpollinterval: self.minpollinterval.unwrap_or(DEFAULT_MIN_POLL_INTERVAL),
            modules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(pairs: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        pairs
            .iter()
            .map(|(id, deps)| {
                (
                    id.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn order_respects_dependencies() {
        let g = graph(&[("c", &["b"]), ("a", &[]), ("b", &["a"])]);
        let order = dependency_order(&g).unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn cycle_is_rejected() {
        let g = graph(&[("x", &["y"]), ("y", &["x"])]);
        match dependency_order(&g) {
            Err(Error::DependencyCycle(msg)) => {
                assert!(msg.contains('x'));
                assert!(msg.contains('y'));
            }
            other => panic!("expected DependencyCycle, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn independent_modules_keep_declaration_order() {
        let g = graph(&[("a", &[]), ("b", &[]), ("c", &[])]);
        assert_eq!(dependency_order(&g).unwrap(), vec!["a", "b", "c"]);
    }
}
