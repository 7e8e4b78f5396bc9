//! C3 linearization of model declarations.

use std::sync::Arc;

use crate::declarative::ModelDeclaration;
use crate::error::{ModelError, ModelResult};

/// Linearize `decl` and its bases, most derived first.
///
/// `root` is appended as an implicit last base of model declarations that do
/// not already inherit from it.
pub fn linearize(
    decl: &Arc<ModelDeclaration>,
    root: Option<&Arc<ModelDeclaration>>,
) -> ModelResult<Vec<Arc<ModelDeclaration>>> {
    let mut bases: Vec<Arc<ModelDeclaration>> = decl.bases.clone();
    if let Some(root) = root {
        let implicit = !decl.is_mixin()
            && !Arc::ptr_eq(decl, root)
            && !bases.iter().any(|b| inherits_from(b, root));
        if implicit {
            bases.push(Arc::clone(root));
        }
    }

    let mut sequences: Vec<Vec<Arc<ModelDeclaration>>> = Vec::with_capacity(bases.len() + 1);
    for base in &bases {
        let root_for_base = if base.is_mixin() { None } else { root };
        sequences.push(linearize(base, root_for_base)?);
    }
    sequences.push(bases);

    let mut result = vec![Arc::clone(decl)];
    loop {
        sequences.retain(|seq| !seq.is_empty());
        if sequences.is_empty() {
            return Ok(result);
        }

        let candidate = sequences
            .iter()
            .map(|seq| &seq[0])
            .find(|head| {
                !sequences
                    .iter()
                    .any(|seq| seq[1..].iter().any(|item| Arc::ptr_eq(item, head)))
            })
            .cloned()
            .ok_or_else(|| {
                ModelError::Configuration(format!(
                    "cannot create a consistent method resolution order for '{}'",
                    decl.name
                ))
            })?;

        for seq in sequences.iter_mut() {
            if Arc::ptr_eq(&seq[0], &candidate) {
                seq.remove(0);
            }
        }
        result.push(candidate);
    }
}

fn inherits_from(decl: &Arc<ModelDeclaration>, ancestor: &Arc<ModelDeclaration>) -> bool {
    Arc::ptr_eq(decl, ancestor) || decl.bases.iter().any(|b| inherits_from(b, ancestor))
}
