use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_ACTIVITY_TYPE: &str = "http://adlnet.gov/expapi/activities/lesson";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Package {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub course_id: Option<Uuid>,
    pub manifest: Manifest,
    pub storage_location: String, // relative to DATA_DIR, e.g. "packages/<uuid>"
    pub byte_size: i64,
    pub uploaded_by: Uuid,
    pub version: String,
    pub is_valid: bool,
    pub validation_errors: Vec<String>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Manifest {
    pub identifier: String,
    pub version: String,
    pub title: String,
    pub description: Option<String>,
    pub creator: Option<String>,
    pub course: Course,
}

/// Index of a [`Block`] inside its course arena.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub usize);

/// Index of an [`Activity`] inside its course arena.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuIndex(pub usize);

/// A course and its block/AU tree.
///
/// Blocks and activities live in flat arenas owned by the course; a block
/// refers to its children by index. Indices are only ever handed out by the
/// tree builder, which appends a child before linking it, so the structure
/// is a tree by construction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Course {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub root: Option<BlockId>,
    pub blocks: Vec<Block>,
    pub activities: Vec<Activity>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Block {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub objectives: Vec<Objective>,
    pub activities: Vec<AuIndex>,
    pub blocks: Vec<BlockId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Objective {
    pub id: String,
    pub title: String,
}

impl Course {
    pub fn root_block(&self) -> Option<&Block> {
        self.root.and_then(|id| self.block(id))
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.0)
    }

    pub fn activity(&self, idx: AuIndex) -> Option<&Activity> {
        self.activities.get(idx.0)
    }

    /// Activities in document order: a block's own AUs first, then its
    /// sub-blocks depth-first.
    pub fn activities_in_order(&self) -> Vec<&Activity> {
        let mut out = Vec::with_capacity(self.activities.len());
        let mut stack: Vec<BlockId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            let Some(block) = self.block(id) else { continue };
            out.extend(block.activities.iter().filter_map(|i| self.activity(*i)));
            stack.extend(block.blocks.iter().rev().copied());
        }
        out
    }

    /// Deepest block nesting below the root; a root with no sub-blocks is depth 0.
    pub fn max_depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack: Vec<(BlockId, usize)> = self.root.map(|r| (r, 0)).into_iter().collect();
        while let Some((id, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            if let Some(block) = self.block(id) {
                stack.extend(block.blocks.iter().map(|b| (*b, depth + 1)));
            }
        }
        deepest
    }
}

/// An Assignable Unit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Activity {
    pub id: Uuid,
    pub package_id: Uuid,
    pub activity_uri: String,
    pub title: String,
    pub description: Option<String>,
    pub launch_url: String, // relative to the package content root
    pub launch_method: LaunchMethod,
    pub move_on: MoveOn,
    pub mastery_score: Option<f64>,
    pub activity_type: String,
    pub duration: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchMethod {
    OwnWindow,
    #[default]
    AnyWindow,
}

impl LaunchMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            LaunchMethod::OwnWindow => "OwnWindow",
            LaunchMethod::AnyWindow => "AnyWindow",
        }
    }

    pub fn parse(v: &str) -> Option<Self> {
        match v {
            "OwnWindow" => Some(LaunchMethod::OwnWindow),
            "AnyWindow" => Some(LaunchMethod::AnyWindow),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MoveOn {
    Passed,
    Completed,
    CompletedAndPassed,
    #[default]
    CompletedOrPassed,
    NotApplicable,
}

impl MoveOn {
    pub const ALL: [MoveOn; 5] = [
        MoveOn::Passed,
        MoveOn::Completed,
        MoveOn::CompletedAndPassed,
        MoveOn::CompletedOrPassed,
        MoveOn::NotApplicable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MoveOn::Passed => "Passed",
            MoveOn::Completed => "Completed",
            MoveOn::CompletedAndPassed => "CompletedAndPassed",
            MoveOn::CompletedOrPassed => "CompletedOrPassed",
            MoveOn::NotApplicable => "NotApplicable",
        }
    }

    pub fn parse(v: &str) -> Option<Self> {
        MoveOn::ALL.into_iter().find(|m| m.as_str() == v)
    }
}

/// Identity context of one content-player invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Session {
    pub learner_id: String,
    pub activity_id: Uuid,
    pub session_id: String,
    pub registration: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActivityState {
    pub activity_id: String,
    pub user_id: String,
    pub state_id: String,
    pub value: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AssignCourseReq {
    pub course_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LaunchReq {
    pub package_id: Uuid,
    pub activity_id: String,
    pub learner_id: String,
    pub session_id: Option<String>,
    pub registration: Option<Uuid>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProgressQuery {
    pub package_id: Uuid,
    pub activity_id: String,
    pub learner_id: String,
    pub registration: Option<Uuid>,
}
