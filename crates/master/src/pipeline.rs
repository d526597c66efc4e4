use serde::{Deserialize, Serialize};

use orchestrator::WorkerControllerSpec;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
}

/// One entry of the legacy flat input list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomInput {
    pub name: String,
    pub repo: String,
    pub glob: String,
}

/// Composable pipeline input tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Input {
    Atom(AtomInput),
    Cross(Vec<Input>),
    Union(Vec<Input>),
}

/// Pipeline definition as stored in the pipelines collection. Records written
/// by old clients carry only the flat `inputs` list; `input` is synthesized
/// from it when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub name: String,
    pub version: u64,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default)]
    pub parallelism: u32,
    pub transform: Transform,
    #[serde(default)]
    pub input: Option<Input>,
    #[serde(default)]
    pub inputs: Vec<AtomInput>,
}

impl PipelineRecord {
    pub fn worker_spec(&self) -> WorkerControllerSpec {
        WorkerControllerSpec {
            pipeline: self.name.clone(),
            version: self.version,
            replicas: self.parallelism.max(1),
            image: self.transform.image.clone(),
        }
    }
}

/// Deterministic translation of the legacy flat input list into an input
/// tree: a single entry is that atom, several entries are their cross
/// product, in list order.
pub fn synthesize_legacy_input(inputs: &[AtomInput]) -> Option<Input> {
    match inputs {
        [] => None,
        [single] => Some(Input::Atom(single.clone())),
        many => Some(Input::Cross(
            many.iter().map(|atom| Input::Atom(atom.clone())).collect(),
        )),
    }
}
