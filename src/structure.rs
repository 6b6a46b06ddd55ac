//! Turns a parsed cmi5 course-structure document into a [`Manifest`] with its
//! block/AU arena.
//!
//! Structural problems (no course, AU without id, duplicate AU id) are fatal.
//! Content problems are collected: `warnings` never affect validity, while
//! `errors` mark the package invalid but still importable.

use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::error::ManifestError;
use crate::manifest::DocNode;
use crate::models::*;

/// Nesting beyond this many block levels is reported.
pub const RECOMMENDED_MAX_DEPTH: usize = 5;

#[derive(Debug, Clone)]
pub struct BuiltManifest {
    pub manifest: Manifest,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

pub fn build_manifest(doc: &DocNode, package_id: Uuid) -> Result<BuiltManifest, ManifestError> {
    let course_node = if doc.name == "course" {
        doc
    } else {
        doc.child("course").ok_or(ManifestError::MissingCourse)?
    };

    let mut b = TreeBuilder {
        package_id,
        course: Course::default(),
        seen_uris: HashSet::new(),
        titles: BTreeMap::new(),
        warnings: Vec::new(),
        errors: Vec::new(),
    };

    let identifier = doc
        .attr("id")
        .or_else(|| course_node.attr("id"))
        .unwrap_or_default()
        .to_string();
    let course_title = course_node.text_of("title").unwrap_or_else(|| {
        b.warnings.push("course has no title".into());
        String::new()
    });
    let course_id = match course_node.attr("id").filter(|s| !s.is_empty()) {
        Some(id) => id.to_string(),
        None => {
            b.warnings.push("course has no id; using the package identifier".into());
            identifier.clone()
        }
    };
    b.course.id = course_id.clone();
    b.course.title = course_title.clone();
    b.course.description = course_node.text_of("description");

    // AUs and blocks may sit inside <course> or next to it under the root.
    let mut top: Vec<&DocNode> = course_node.children.iter().filter(|c| is_structural(c)).collect();
    if !std::ptr::eq(doc, course_node) {
        top.extend(doc.children.iter().filter(|c| is_structural(c)));
    }

    if !top.is_empty() {
        let description = b.course.description.clone();
        let root = b.push_block(Block {
            id: course_id,
            title: course_title.clone(),
            description,
            objectives: Vec::new(),
            activities: Vec::new(),
            blocks: Vec::new(),
        });
        b.course.root = Some(root);

        let mut pending: Vec<(BlockId, Vec<&DocNode>)> = vec![(root, top)];
        while let Some((parent, nodes)) = pending.pop() {
            for node in nodes {
                match node.name.as_str() {
                    "au" => {
                        let idx = b.add_activity(node)?;
                        b.course.blocks[parent.0].activities.push(idx);
                    }
                    "block" => {
                        let block = b.read_block(node);
                        let id = b.push_block(block);
                        b.course.blocks[parent.0].blocks.push(id);
                        let kids = node.children.iter().filter(|c| is_structural(c)).collect();
                        pending.push((id, kids));
                    }
                    _ => {}
                }
            }
        }
    }

    if b.course.activities.is_empty() {
        b.warnings.push("course contains no launchable activities".into());
    }
    if b.course.max_depth() > RECOMMENDED_MAX_DEPTH {
        b.warnings.push(format!(
            "block nesting exceeds the recommended {RECOMMENDED_MAX_DEPTH} levels"
        ));
    }
    for (title, count) in &b.titles {
        if *count > 1 {
            b.warnings.push(format!("{count} AUs share the title '{title}'"));
        }
    }

    let title = if course_title.is_empty() {
        doc.text_of("title").unwrap_or_else(|| identifier.clone())
    } else {
        course_title
    };
    let manifest = Manifest {
        identifier,
        version: doc.attr("version").unwrap_or("1.0").to_string(),
        title,
        description: b.course.description.clone(),
        creator: course_node
            .text_of("creator")
            .or_else(|| course_node.child("metadata").and_then(|m| m.text_of("publisher"))),
        course: b.course,
    };
    Ok(BuiltManifest { manifest, warnings: b.warnings, errors: b.errors })
}

struct TreeBuilder {
    package_id: Uuid,
    course: Course,
    seen_uris: HashSet<String>,
    /// Ordered so duplicate-title warnings come out the same every run.
    titles: BTreeMap<String, usize>,
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl TreeBuilder {
    fn push_block(&mut self, block: Block) -> BlockId {
        self.course.blocks.push(block);
        BlockId(self.course.blocks.len() - 1)
    }

    fn read_block(&mut self, node: &DocNode) -> Block {
        let id = match node.attr("id").filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                let generated = format!("block-{}", self.course.blocks.len());
                self.warnings.push(format!("block without id; assigned '{generated}'"));
                generated
            }
        };
        let title = node.text_of("title").unwrap_or_else(|| {
            self.warnings.push(format!("block '{id}' has no title"));
            String::new()
        });
        let objectives = node
            .child("objectives")
            .map(|o| {
                o.children_named("objective")
                    .map(|obj| Objective {
                        id: obj.attr("id").unwrap_or_default().to_string(),
                        title: if obj.text.is_empty() {
                            obj.text_of("title").unwrap_or_default()
                        } else {
                            obj.text.clone()
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();
        Block {
            id,
            title,
            description: node.text_of("description"),
            objectives,
            activities: Vec::new(),
            blocks: Vec::new(),
        }
    }

    fn add_activity(&mut self, node: &DocNode) -> Result<AuIndex, ManifestError> {
        let title = node.text_of("title");
        let uri = node.attr("id").map(str::trim).unwrap_or_default();
        if uri.is_empty() {
            return Err(ManifestError::MissingActivityId { title: title.unwrap_or_default() });
        }
        if !self.seen_uris.insert(uri.to_string()) {
            return Err(ManifestError::DuplicateActivity(uri.to_string()));
        }

        let title = match title {
            Some(t) => {
                *self.titles.entry(t.clone()).or_default() += 1;
                t
            }
            None => {
                self.warnings.push(format!("AU '{uri}' has no title"));
                uri.to_string()
            }
        };

        let move_on = match node.attr("moveOn") {
            Some(v) => MoveOn::parse(v).unwrap_or_else(|| {
                self.warnings.push(format!(
                    "AU '{uri}' has unknown moveOn '{v}'; defaulting to CompletedOrPassed"
                ));
                MoveOn::default()
            }),
            None => {
                self.warnings
                    .push(format!("AU '{uri}' has no moveOn; defaulting to CompletedOrPassed"));
                MoveOn::default()
            }
        };

        let mastery_score = node.attr("masteryScore").and_then(|raw| {
            match raw.trim().parse::<f64>() {
                Ok(v) if (0.0..=1.0).contains(&v) => Some(v),
                _ => {
                    self.warnings
                        .push(format!("AU '{uri}' has invalid masteryScore '{raw}'; ignored"));
                    None
                }
            }
        });

        let launch_method = match node.attr("launchMethod") {
            Some(v) => LaunchMethod::parse(v).unwrap_or_else(|| {
                self.warnings.push(format!("AU '{uri}' has unknown launchMethod '{v}'"));
                LaunchMethod::default()
            }),
            None => LaunchMethod::default(),
        };

        let launch_url = node.text_of("url").unwrap_or_default();
        if launch_url.is_empty() {
            self.errors.push(format!("AU '{uri}' has no launch url"));
        }

        self.course.activities.push(Activity {
            id: Uuid::new_v4(),
            package_id: self.package_id,
            activity_uri: uri.to_string(),
            title,
            description: node.text_of("description"),
            launch_url,
            launch_method,
            move_on,
            mastery_score,
            activity_type: node
                .attr("activityType")
                .map(str::to_string)
                .or_else(|| node.text_of("activityType"))
                .unwrap_or_else(|| DEFAULT_ACTIVITY_TYPE.to_string()),
            duration: node.text_of("duration"),
        });
        Ok(AuIndex(self.course.activities.len() - 1))
    }
}

fn is_structural(node: &DocNode) -> bool {
    node.name == "au" || node.name == "block"
}
