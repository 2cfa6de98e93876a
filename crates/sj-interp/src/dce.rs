//! Dead-code elimination: backward reachability from declared outputs.

use rustc_hash::FxHashSet;
use sj_core::{Atom, Equation, Program, VarId};

/// Prune equations that do not contribute to any used output.
///
/// `used_outputs` aligns with the program's declared outputs. Returns the
/// pruned program (equation order preserved, unused outputs dropped, never
/// more equations than the input) and a mask of which declared inputs are
/// still needed. Idempotent.
#[must_use]
pub fn dce_program(program: &Program, used_outputs: &[bool]) -> (Program, Vec<bool>) {
    let mut needed: FxHashSet<VarId> = FxHashSet::default();

    for (var, used) in program.outvars.iter().zip(used_outputs.iter()) {
        if *used {
            needed.insert(*var);
        }
    }

    let mut keep = vec![false; program.equations.len()];
    for (index, eqn) in program.equations.iter().enumerate().rev() {
        if eqn.outputs.iter().any(|var| needed.contains(var)) {
            keep[index] = true;
            for atom in &eqn.inputs {
                if let Atom::Var(var) = atom {
                    needed.insert(*var);
                }
            }
        }
    }

    let retained: Vec<Equation> = program
        .equations
        .iter()
        .zip(keep.iter())
        .filter(|(_, keep)| **keep)
        .map(|(eqn, _)| eqn.clone())
        .collect();

    let used_inputs: Vec<bool> = program
        .invars
        .iter()
        .map(|var| needed.contains(var))
        .collect();

    let pruned_outvars: Vec<VarId> = program
        .outvars
        .iter()
        .zip(used_outputs.iter())
        .filter(|(_, used)| **used)
        .map(|(var, _)| *var)
        .collect();

    let pruned = Program::with_consts(
        program.invars.clone(),
        program.constvars.clone(),
        program.consts.clone(),
        pruned_outvars,
        retained,
    );

    (pruned, used_inputs)
}

/// Prune against all declared outputs.
#[must_use]
pub fn prune_unreachable(program: &Program) -> Program {
    let all_used = vec![true; program.outvars.len()];
    dce_program(program, &all_used).0
}

#[cfg(test)]
mod tests {
    use super::{dce_program, prune_unreachable};
    use sj_core::{Atom, Equation, Primitive, Program, VarId, linear_chain_program};
    use smallvec::smallvec;
    use std::collections::BTreeMap;

    fn fanout_program() -> Program {
        // Two independent equations off the same input; two declared outputs.
        Program::new(
            vec![VarId(1)],
            vec![VarId(2), VarId(3)],
            vec![
                Equation {
                    primitive: Primitive::Neg,
                    inputs: smallvec![Atom::Var(VarId(1))],
                    outputs: smallvec![VarId(2)],
                    params: BTreeMap::new(),
                },
                Equation {
                    primitive: Primitive::Abs,
                    inputs: smallvec![Atom::Var(VarId(1))],
                    outputs: smallvec![VarId(3)],
                    params: BTreeMap::new(),
                },
            ],
        )
    }

    #[test]
    fn drops_equation_feeding_only_unused_output() {
        let program = fanout_program();
        let (pruned, used_inputs) = dce_program(&program, &[true, false]);
        assert_eq!(pruned.equations.len(), 1);
        assert_eq!(pruned.equations[0].primitive, Primitive::Neg);
        assert_eq!(used_inputs, vec![true]);
    }

    #[test]
    fn keeps_transitive_chain_dependencies() {
        let program = linear_chain_program(100);
        let (pruned, used_inputs) = dce_program(&program, &[true]);
        assert_eq!(pruned.equations.len(), 100);
        assert_eq!(used_inputs, vec![true]);
    }

    #[test]
    fn never_increases_equation_count_and_is_idempotent() {
        let program = fanout_program();
        let (once, _) = dce_program(&program, &[true, false]);
        assert!(once.equations.len() <= program.equations.len());
        assert_eq!(once.outvars.len(), 1);
        let (twice, _) = dce_program(&once, &[true]);
        assert_eq!(once, twice);
    }

    #[test]
    fn no_used_output_prunes_everything() {
        let program = fanout_program();
        let (pruned, used_inputs) = dce_program(&program, &[false, false]);
        assert!(pruned.equations.is_empty());
        assert_eq!(used_inputs, vec![false]);
    }

    #[test]
    fn prune_unreachable_uses_all_declared_outputs() {
        let program = fanout_program();
        let pruned = prune_unreachable(&program);
        assert_eq!(pruned.equations.len(), 2);
    }
}
