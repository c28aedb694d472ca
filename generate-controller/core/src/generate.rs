use crate::k8s::{
    policy::{self, CloneFrom, CloneList, ContextEntry, Generation},
    ResourceSpec,
};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// A validated generate rule.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationSpec {
    pub synchronize: bool,
    pub orphan_downstream_on_policy_delete: bool,
    pub body: Body,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Single(Template),
    ForEach(Vec<ForEach>),
}

/// A target resource together with the content used to populate it.
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    /// May contain variable references.
    pub target: ResourceSpec,
    pub source: Source,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Source {
    Data(Value),
    Clone(CloneFrom),
    CloneList(CloneList),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForEach {
    pub list: String,
    pub context: Vec<ContextEntry>,
    pub template: Template,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GenerateType {
    Data,
    Clone,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidGeneration {
    #[error("exactly one of data, clone or cloneList must be specified")]
    NoSource,

    #[error("only one of data, clone or cloneList may be specified")]
    MultipleSources,

    #[error("foreach cannot be combined with a top-level data, clone or cloneList")]
    ForEachWithSource,

    #[error("kind can not be empty")]
    MissingKind,

    #[error("name can not be empty")]
    MissingName,

    #[error("clone requires a source name")]
    MissingCloneName,

    #[error("cloneList requires at least one kind")]
    MissingCloneListKinds,

    #[error("foreach[{index}]: {error}")]
    ForEach {
        index: usize,
        #[source]
        error: Box<InvalidGeneration>,
    },
}

/// Selects a kind, optionally qualified by group and version:
/// `Kind`, `version/Kind` or `group/version/Kind`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KindSelector {
    pub group: Option<String>,
    pub version: Option<String>,
    pub kind: String,
}

// === impl GenerationSpec ===

impl TryFrom<&Generation> for GenerationSpec {
    type Error = InvalidGeneration;

    fn try_from(generation: &Generation) -> Result<Self, Self::Error> {
        let body = if generation.foreach.is_empty() {
            Body::Single(Template::try_from(&generation.pattern)?)
        } else {
            if source_count(&generation.pattern) > 0 {
                return Err(InvalidGeneration::ForEachWithSource);
            }
            let foreach = generation
                .foreach
                .iter()
                .enumerate()
                .map(|(index, fe)| {
                    let template =
                        Template::try_from(&fe.pattern).map_err(|e| InvalidGeneration::ForEach {
                            index,
                            error: Box::new(e),
                        })?;
                    Ok(ForEach {
                        list: fe.list.clone(),
                        context: fe.context.clone(),
                        template,
                    })
                })
                .collect::<Result<Vec<_>, InvalidGeneration>>()?;
            Body::ForEach(foreach)
        };

        Ok(Self {
            synchronize: generation.synchronize,
            orphan_downstream_on_policy_delete: generation.orphan_downstream_on_policy_delete,
            body,
        })
    }
}

impl GenerationSpec {
    /// Returns the generation type, i.e. whether content comes from inline data
    /// or from cloned sources.
    pub fn generate_type(&self) -> GenerateType {
        let is_data = match &self.body {
            Body::Single(t) => matches!(t.source, Source::Data(_)),
            Body::ForEach(fes) => fes
                .iter()
                .any(|fe| matches!(fe.template.source, Source::Data(_))),
        };
        if is_data {
            GenerateType::Data
        } else {
            GenerateType::Clone
        }
    }

    pub fn templates(&self) -> impl Iterator<Item = &Template> {
        let (single, foreach) = match &self.body {
            Body::Single(t) => (Some(t), &[][..]),
            Body::ForEach(fes) => (None, fes.as_slice()),
        };
        single
            .into_iter()
            .chain(foreach.iter().map(|fe| &fe.template))
    }
}

// === impl Template ===

impl TryFrom<&policy::GeneratePattern> for Template {
    type Error = InvalidGeneration;

    fn try_from(pattern: &policy::GeneratePattern) -> Result<Self, Self::Error> {
        let source = match source_count(pattern) {
            0 => return Err(InvalidGeneration::NoSource),
            1 => {
                if let Some(data) = pattern.data.as_ref().filter(|d| !d.is_null()) {
                    Source::Data(data.clone())
                } else if let Some(clone) = pattern.clone.as_ref().filter(|c| is_set_clone(c)) {
                    if clone.name.is_empty() {
                        return Err(InvalidGeneration::MissingCloneName);
                    }
                    Source::Clone(clone.clone())
                } else if let Some(list) = pattern.clone_list.as_ref().filter(|l| is_set_list(l)) {
                    if list.kinds.is_empty() {
                        return Err(InvalidGeneration::MissingCloneListKinds);
                    }
                    Source::CloneList(list.clone())
                } else {
                    return Err(InvalidGeneration::NoSource);
                }
            }
            _ => return Err(InvalidGeneration::MultipleSources),
        };

        if !matches!(source, Source::CloneList(_)) {
            if pattern.kind.is_empty() {
                return Err(InvalidGeneration::MissingKind);
            }
            if pattern.name.is_empty() {
                return Err(InvalidGeneration::MissingName);
            }
        }

        Ok(Self {
            target: pattern.target(),
            source,
        })
    }
}

impl Template {
    pub fn is_clone(&self) -> bool {
        matches!(self.source, Source::Clone(_) | Source::CloneList(_))
    }
}

// `clone: {}` and `cloneList: {}` are equivalent to omitting them.
fn is_set_clone(c: &CloneFrom) -> bool {
    !c.name.is_empty() || !c.namespace.is_empty()
}

fn is_set_list(l: &CloneList) -> bool {
    !l.kinds.is_empty() || !l.namespace.is_empty() || l.selector.is_some()
}

fn source_count(pattern: &policy::GeneratePattern) -> usize {
    let data = pattern.data.as_ref().map(|d| !d.is_null()).unwrap_or(false);
    let clone = pattern.clone.as_ref().map(is_set_clone).unwrap_or(false);
    let list = pattern.clone_list.as_ref().map(is_set_list).unwrap_or(false);
    [data, clone, list].into_iter().filter(|b| *b).count()
}

// === impl KindSelector ===

impl FromStr for KindSelector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.split('/').collect::<Vec<_>>();
        let sel = match parts.as_slice() {
            [kind] => Self {
                group: None,
                version: None,
                kind: kind.to_string(),
            },
            [version, kind] => Self {
                group: None,
                version: Some(version.to_string()),
                kind: kind.to_string(),
            },
            [group, version, kind] => Self {
                group: Some(group.to_string()),
                version: Some(version.to_string()),
                kind: kind.to_string(),
            },
            _ => anyhow::bail!("invalid kind selector: {s}"),
        };
        if sel.kind.is_empty() {
            anyhow::bail!("invalid kind selector: {s}");
        }
        Ok(sel)
    }
}

impl KindSelector {
    /// The selector's `apiVersion`, if a version is specified.
    pub fn api_version(&self) -> Option<String> {
        let version = self.version.as_ref()?;
        Some(match self.group.as_deref() {
            Some(group) if !group.is_empty() => format!("{group}/{version}"),
            _ => version.clone(),
        })
    }
}

impl fmt::Display for KindSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(group) = self.group.as_ref() {
            write!(f, "{group}/")?;
        }
        if let Some(version) = self.version.as_ref() {
            write!(f, "{version}/")?;
        }
        f.write_str(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::policy::{ForEachGeneration, GeneratePattern};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn target() -> GeneratePattern {
        GeneratePattern {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            namespace: "default".to_string(),
            name: "cm".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn data() {
        let generation = Generation {
            synchronize: true,
            pattern: GeneratePattern {
                data: Some(json!({"data": {"k": "v"}})),
                ..target()
            },
            ..Default::default()
        };
        let spec = GenerationSpec::try_from(&generation).unwrap();
        assert!(spec.synchronize);
        assert_eq!(spec.generate_type(), GenerateType::Data);
        assert_eq!(
            spec.body,
            Body::Single(Template {
                target: ResourceSpec::new("v1", "ConfigMap", "default", "cm"),
                source: Source::Data(json!({"data": {"k": "v"}})),
            })
        );
    }

    #[test]
    fn empty_clone_is_ignored() {
        let generation = Generation {
            pattern: GeneratePattern {
                data: Some(json!({})),
                clone: Some(CloneFrom::default()),
                clone_list: Some(CloneList::default()),
                ..target()
            },
            ..Default::default()
        };
        let spec = GenerationSpec::try_from(&generation).unwrap();
        assert_eq!(spec.generate_type(), GenerateType::Data);
    }

    #[test]
    fn rejects_invalid() {
        let cases = vec![
            (target(), InvalidGeneration::NoSource),
            (
                GeneratePattern {
                    data: Some(json!({})),
                    clone: Some(CloneFrom {
                        namespace: "default".to_string(),
                        name: "src".to_string(),
                    }),
                    ..target()
                },
                InvalidGeneration::MultipleSources,
            ),
            (
                GeneratePattern {
                    clone: Some(CloneFrom {
                        namespace: "default".to_string(),
                        name: String::new(),
                    }),
                    ..target()
                },
                InvalidGeneration::MissingCloneName,
            ),
            (
                GeneratePattern {
                    clone_list: Some(CloneList {
                        namespace: "default".to_string(),
                        ..Default::default()
                    }),
                    ..target()
                },
                InvalidGeneration::MissingCloneListKinds,
            ),
            (
                GeneratePattern {
                    data: Some(json!({})),
                    name: String::new(),
                    ..target()
                },
                InvalidGeneration::MissingName,
            ),
            (
                GeneratePattern {
                    data: Some(json!({})),
                    kind: String::new(),
                    ..target()
                },
                InvalidGeneration::MissingKind,
            ),
        ];
        for (pattern, expected) in cases {
            let generation = Generation {
                pattern,
                ..Default::default()
            };
            assert_eq!(GenerationSpec::try_from(&generation), Err(expected));
        }
    }

    #[test]
    fn clone_list_needs_no_target_name() {
        let generation = Generation {
            pattern: GeneratePattern {
                namespace: "{{request.object.metadata.name}}".to_string(),
                clone_list: Some(CloneList {
                    namespace: "default".to_string(),
                    kinds: vec!["v1/Secret".to_string()],
                    selector: None,
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let spec = GenerationSpec::try_from(&generation).unwrap();
        assert_eq!(spec.generate_type(), GenerateType::Clone);
        assert!(spec.templates().all(Template::is_clone));
    }

    #[test]
    fn foreach() {
        let generation = Generation {
            foreach: vec![ForEachGeneration {
                list: "request.object.spec.namespaces".to_string(),
                context: vec![],
                pattern: GeneratePattern {
                    data: Some(json!({})),
                    ..target()
                },
            }],
            ..Default::default()
        };
        let spec = GenerationSpec::try_from(&generation).unwrap();
        assert_eq!(spec.templates().count(), 1);
        assert!(matches!(spec.body, Body::ForEach(ref fes) if fes.len() == 1));

        let mut invalid = generation.clone();
        invalid.pattern.data = Some(json!({}));
        assert_eq!(
            GenerationSpec::try_from(&invalid),
            Err(InvalidGeneration::ForEachWithSource)
        );

        let mut invalid = generation;
        invalid.foreach[0].pattern.data = None;
        assert_eq!(
            GenerationSpec::try_from(&invalid),
            Err(InvalidGeneration::ForEach {
                index: 0,
                error: Box::new(InvalidGeneration::NoSource),
            })
        );
    }

    #[test]
    fn kind_selectors() {
        let sel: KindSelector = "Secret".parse().unwrap();
        assert_eq!(sel.api_version(), None);
        assert_eq!(sel.kind, "Secret");

        let sel: KindSelector = "v1/ConfigMap".parse().unwrap();
        assert_eq!(sel.api_version().as_deref(), Some("v1"));

        let sel: KindSelector = "networking.k8s.io/v1/NetworkPolicy".parse().unwrap();
        assert_eq!(sel.api_version().as_deref(), Some("networking.k8s.io/v1"));
        assert_eq!(sel.kind, "NetworkPolicy");
        assert_eq!(sel.to_string(), "networking.k8s.io/v1/NetworkPolicy");

        assert!("a/b/c/d".parse::<KindSelector>().is_err());
        assert!("v1/".parse::<KindSelector>().is_err());
    }
}
