//! Resolved outputs of a stage's dependencies.

use crate::core::Target;
use crate::naming::StageId;
use std::path::{Path, PathBuf};

/// Outputs of each dependency, in the order the dependencies were declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageInputs {
    entries: Vec<(StageId, Vec<Target>)>,
}

impl StageInputs {
    /// Creates inputs from `(dependency, outputs)` pairs.
    #[must_use]
    pub fn new(entries: Vec<(StageId, Vec<Target>)>) -> Self {
        Self { entries }
    }

    /// Appends the outputs of one dependency.
    pub fn push(&mut self, stage: StageId, outputs: Vec<Target>) {
        self.entries.push((stage, outputs));
    }

    /// Returns the number of dependencies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no dependencies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the outputs of the `i`-th dependency.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<&[Target]> {
        self.entries.get(i).map(|(_, targets)| targets.as_slice())
    }

    /// Returns the outputs of the dependency with the given id.
    #[must_use]
    pub fn by_id(&self, id: &StageId) -> Option<&[Target]> {
        self.entries
            .iter()
            .find(|(stage, _)| stage == id)
            .map(|(_, targets)| targets.as_slice())
    }

    /// Returns the `j`-th output of the `i`-th dependency.
    #[must_use]
    pub fn target(&self, i: usize, j: usize) -> Option<&Target> {
        self.get(i).and_then(|targets| targets.get(j))
    }

    /// Returns the primary path of the `j`-th output of the `i`-th dependency.
    #[must_use]
    pub fn path(&self, i: usize, j: usize) -> Option<&Path> {
        self.target(i, j).map(Target::path)
    }

    /// Iterates over `(dependency, outputs)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&StageId, &[Target])> {
        self.entries.iter().map(|(id, t)| (id, t.as_slice()))
    }

    /// Returns every primary path across all dependencies, in order.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries
            .iter()
            .flat_map(|(_, targets)| targets.iter().map(|t| t.path().to_path_buf()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let inputs = StageInputs::new(vec![
            (StageId::new("fetch_fasta"), vec![Target::indexed("/ref/hg38.fa", ".fai")]),
            (
                StageId::new("align"),
                vec![Target::new("/o/t.cram"), Target::new("/o/n.cram")],
            ),
        ]);

        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs.path(0, 0), Some(Path::new("/ref/hg38.fa")));
        assert_eq!(inputs.path(1, 1), Some(Path::new("/o/n.cram")));
        assert!(inputs.path(2, 0).is_none());
        assert_eq!(inputs.by_id(&StageId::new("align")).map(<[Target]>::len), Some(2));
        assert_eq!(
            inputs.paths(),
            vec![
                PathBuf::from("/ref/hg38.fa"),
                PathBuf::from("/o/t.cram"),
                PathBuf::from("/o/n.cram")
            ]
        );
    }
}
