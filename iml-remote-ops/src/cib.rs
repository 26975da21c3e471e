// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Reading and rewriting the Pacemaker CIB.

use elementtree::Element;
use std::{collections::HashMap, fmt};

/// standard:provider:ocftype (e.g. ocf:lustre:Lustre, or stonith:fence_chroma)
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceAgentType {
    pub standard: String,
    pub provider: Option<String>,
    pub ocftype: String,
}

impl ResourceAgentType {
    pub fn new(standard: &str, provider: Option<&str>, ocftype: &str) -> Self {
        ResourceAgentType {
            standard: standard.to_string(),
            provider: provider.map(String::from),
            ocftype: ocftype.to_string(),
        }
    }
}

impl fmt::Display for ResourceAgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.provider {
            Some(provider) => write!(f, "{}:{}:{}", self.standard, provider, self.ocftype),
            None => write!(f, "{}:{}", self.standard, self.ocftype),
        }
    }
}

/// Resource agents a managed Lustre target may be configured with.
///
/// IML 4 wraps every target in `ocf:chroma:Target`. Later releases use the
/// stock Lustre agent, with a separate ZFS agent for pool import.
pub fn target_agents(iml_4: bool) -> Vec<ResourceAgentType> {
    if iml_4 {
        vec![ResourceAgentType::new("ocf", Some("chroma"), "Target")]
    } else {
        vec![
            ResourceAgentType::new("ocf", Some("heartbeat"), "ZFS"),
            ResourceAgentType::new("ocf", Some("chroma"), "ZFS"),
            ResourceAgentType::new("ocf", Some("lustre"), "Lustre"),
        ]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentInfo {
    pub agent: ResourceAgentType,
    pub group: Option<String>,
    pub id: String,
    pub args: HashMap<String, String>,
}

impl AgentInfo {
    fn create(elem: &Element, group: Option<String>) -> Self {
        AgentInfo {
            agent: ResourceAgentType::new(
                elem.get_attr("class").unwrap_or(""),
                elem.get_attr("provider"),
                elem.get_attr("type").unwrap_or(""),
            ),
            group,
            id: elem.get_attr("id").unwrap_or("").to_string(),
            args: match elem.find("instance_attributes") {
                None => HashMap::new(),
                Some(e) => e
                    .find_all("nvpair")
                    .map(|nv| {
                        (
                            nv.get_attr("name").unwrap_or("").to_string(),
                            nv.get_attr("value").unwrap_or("").to_string(),
                        )
                    })
                    .collect(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RscLocation {
    pub id: String,
    pub rsc: String,
    pub node: Option<String>,
    pub score: Option<String>,
}

/// A parsed CIB, either the full `<cib>` document or a bare `<resources>`
/// section.
#[derive(Debug, Clone)]
pub struct Cib {
    root: Element,
}

impl Cib {
    pub fn parse(xml: &str) -> Result<Self, elementtree::Error> {
        Ok(Cib {
            root: Element::from_reader(xml.as_bytes())?,
        })
    }

    fn section<'a>(&'a self, name: &'a str) -> Option<&'a Element> {
        if self.root.tag().name() == name {
            return Some(&self.root);
        }

        self.root.find("configuration").and_then(|x| x.find(name))
    }

    /// Every primitive, grouped ones first.
    pub fn primitives(&self) -> Vec<AgentInfo> {
        let resources = match self.section("resources") {
            Some(x) => x,
            None => return vec![],
        };

        resources
            .find_all("group")
            .flat_map(|g| {
                let name = g.get_attr("id").unwrap_or("").to_string();
                g.find_all("primitive")
                    .map(move |p| AgentInfo::create(p, Some(name.clone())))
            })
            .chain(
                resources
                    .find_all("primitive")
                    .map(|p| AgentInfo::create(p, None)),
            )
            .collect()
    }

    pub fn locations(&self) -> Vec<RscLocation> {
        let constraints = match self.section("constraints") {
            Some(x) => x,
            None => return vec![],
        };

        constraints
            .find_all("rsc_location")
            .map(|x| RscLocation {
                id: x.get_attr("id").unwrap_or("").to_string(),
                rsc: x.get_attr("rsc").unwrap_or("").to_string(),
                node: x.get_attr("node").map(String::from),
                score: x.get_attr("score").map(String::from),
            })
            .collect()
    }

    pub fn admin_epoch(&self) -> Option<u64> {
        self.root.get_attr("admin_epoch").and_then(|x| x.parse().ok())
    }

    pub fn epoch(&self) -> Option<u64> {
        self.root.get_attr("epoch").and_then(|x| x.parse().ok())
    }

    /// Makes this CIB win over `live`, the `admin_epoch` the cluster
    /// currently holds.
    ///
    /// Pacemaker only accepts a replacement whose version is newer, so
    /// `admin_epoch` goes one past the higher of the two and `epoch` restarts
    /// at zero.
    pub fn bump_admin_epoch(&mut self, live: Option<u64>) {
        let next = self.admin_epoch().max(live).unwrap_or(0) + 1;

        self.root
            .set_attr("admin_epoch", next.to_string())
            .set_attr("epoch", "0");
    }

    pub fn to_xml(&self) -> Result<String, elementtree::Error> {
        self.root.to_string()
    }

    /// Problems with the HA configuration of filesystem `fs_name` as seen
    /// from the node known as any of `node_names`.
    ///
    /// An empty result means the node has a location constraint and at least
    /// one target primitive of the filesystem uses one of `agents`.
    pub fn filesystem_ha_errors(
        &self,
        node_names: &[&str],
        fs_name: &str,
        agents: &[ResourceAgentType],
    ) -> Vec<String> {
        let mut errors = vec![];

        let has_location = self.locations().iter().any(|x| {
            x.node
                .as_deref()
                .map(|n| node_names.contains(&n))
                .unwrap_or(false)
        });

        if !has_location {
            errors.push(format!("No rsc_location for node {}", node_names.join("/")));
        }

        let prefix = format!("{}-", fs_name);

        let has_primitive = self
            .primitives()
            .iter()
            .any(|x| x.id.starts_with(&prefix) && agents.contains(&x.agent));

        if !has_primitive {
            let names: Vec<_> = agents.iter().map(|x| x.to_string()).collect();

            errors.push(format!(
                "No primitive named {}* of type {}",
                prefix,
                names.join(" or ")
            ));
        }

        errors
    }
}
