use crate::id::{SolvableId, SpecId};
use crate::pool::Pool;

/// The kinds of rules the solver reasons over. Every rule is a disjunction
/// of literals over solvables; the kinds encode the shapes that occur when
/// solving package installations.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum RuleKind {
    /// The root solvable must be installed. The seed of every solve.
    InstallRoot,

    /// The solvable requires one of the candidates of the spec.
    ///
    /// In SAT terms: `(¬A ∨ B1 ∨ … ∨ Bn)` where `B1..Bn` are the
    /// candidates of the spec.
    Requires(SolvableId, SpecId),

    /// The two solvables cannot be installed together. Emitted for pairs of
    /// candidates that share a package name, and with the root as the left
    /// side for packages forbidden outright (remove and lock jobs).
    ///
    /// In SAT terms: `(¬A ∨ ¬B)`.
    Forbids(SolvableId, SolvableId),

    /// Like [`RuleKind::Forbids`], but the exclusion stems from a
    /// `constrains` entry of the left solvable; the spec is kept for
    /// diagnostics.
    Constrains(SolvableId, SolvableId, SpecId),
}

#[derive(Debug, Clone)]
pub(crate) struct Rule {
    pub kind: RuleKind,
}

impl Rule {
    pub fn new(kind: RuleKind) -> Self {
        Self { kind }
    }

    /// The solvables whose decisions can participate in a conflict on this
    /// rule. Used when walking back from a top level conflict to collect
    /// the problem set.
    pub fn involved_solvables(&self, pool: &Pool) -> Vec<SolvableId> {
        match self.kind {
            RuleKind::InstallRoot => vec![SolvableId::root()],
            RuleKind::Requires(owner, spec_id) => {
                let mut solvables = vec![owner];
                if let Some(candidates) = pool.candidates[spec_id.index()].as_deref() {
                    solvables.extend_from_slice(candidates);
                }
                solvables
            }
            RuleKind::Forbids(a, b) | RuleKind::Constrains(a, b, _) => vec![a, b],
        }
    }
}
