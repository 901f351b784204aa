//! Solver back-end plug-in interface and the CBC adapter.

use super::{Comp, System, VarId, VarType};
use crate::error::{Error, Result};
use ahash::AHashMap;

/// Optimum and variable assignment returned by a back-end.
#[derive(Debug, Clone)]
pub struct IlpSolution {
    pub objective: f64,
    values: Vec<f64>,
}

impl IlpSolution {
    pub fn value(&self, var: VarId) -> f64 {
        self.values[var.0 as usize]
    }

    /// Integer-rounded count, for execution-count variables.
    pub fn count(&self, var: VarId) -> u64 {
        self.value(var).round().max(0.0) as u64
    }
}

/// A solver plug-in: consumes a system, returns the optimum and an
/// assignment, or a solver error. Integer variables must be supported.
pub trait IlpBackend {
    fn name(&self) -> &str;
    fn solve(&self, sys: &System) -> Result<IlpSolution>;
}

/// Back-end over the CBC MILP solver.
pub struct CbcBackend;

impl IlpBackend for CbcBackend {
    fn name(&self) -> &str {
        "cbc"
    }

    fn solve(&self, sys: &System) -> Result<IlpSolution> {
        use good_lp::{default_solver, variable, Expression, ProblemVariables, Solution, SolverModel};

        let mut pv = ProblemVariables::new();
        let mut gvars = Vec::with_capacity(sys.var_count());
        for var in sys.vars() {
            let def = match var.ty {
                VarType::Int => variable().integer().min(0),
                VarType::Bin => variable().integer().min(0).max(1),
                VarType::Float => variable().min(0),
            };
            gvars.push(pv.add(def));
        }

        let objective: Expression = sys
            .objective()
            .iter()
            .map(|&(v, c)| gvars[v.0 as usize] * c)
            .sum();

        let mut model = if sys.is_maximize() {
            pv.maximise(objective.clone()).using(default_solver)
        } else {
            pv.minimise(objective.clone()).using(default_solver)
        };
        model.set_parameter("loglevel", "0");

        for cons in sys.constraints() {
            let lhs: Expression = cons
                .terms
                .iter()
                .map(|&(v, c)| gvars[v.0 as usize] * c)
                .sum();
            let c = match cons.comp {
                // integer variables make the strict forms equivalent
                Comp::Le | Comp::Lt => good_lp::constraint::leq(lhs, cons.constant),
                Comp::Ge | Comp::Gt => good_lp::constraint::geq(lhs, cons.constant),
                Comp::Eq => good_lp::constraint::eq(lhs, cons.constant),
            };
            model = model.with(c);
        }

        let solution = model
            .solve()
            .map_err(|e| Error::Solver(format!("{:?}", e)))?;

        let values = gvars.iter().map(|&v| solution.value(v)).collect();
        Ok(IlpSolution {
            objective: solution.eval(&objective),
            values,
        })
    }
}

/// Back-end registry lookup for the `--ilp` option.
pub fn backend_by_name(name: &str) -> Result<Box<dyn IlpBackend>> {
    match name.to_ascii_lowercase().as_str() {
        "cbc" | "default" => Ok(Box::new(CbcBackend)),
        other => Err(Error::Config(format!("unknown ILP back-end '{}'", other))),
    }
}

/// Naive reference evaluation used by tests: checks an assignment against
/// every constraint.
pub fn feasible(sys: &System, values: &AHashMap<VarId, f64>) -> bool {
    sys.constraints().iter().all(|cons| {
        let lhs: f64 = cons
            .terms
            .iter()
            .map(|&(v, c)| c * values.get(&v).copied().unwrap_or(0.0))
            .sum();
        match cons.comp {
            Comp::Lt => lhs < cons.constant,
            Comp::Le => lhs <= cons.constant + 1e-6,
            Comp::Eq => (lhs - cons.constant).abs() < 1e-6,
            Comp::Ge => lhs >= cons.constant - 1e-6,
            Comp::Gt => lhs > cons.constant,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// max 7x + 3y  s.t. x = 1, y <= 10x  ->  optimum 37
    fn sample() -> System {
        let mut sys = System::maximize();
        let x = sys.new_var("x", VarType::Int);
        let y = sys.new_var("y", VarType::Int);
        let c = sys.new_constraint(Some("entry".into()), Comp::Eq, 1.0);
        sys.add_term(c, x, 1.0);
        let b = sys.new_constraint(Some("bound".into()), Comp::Le, 0.0);
        sys.add_term(b, y, 1.0);
        sys.add_term(b, x, -10.0);
        sys.add_objective(7.0, x);
        sys.add_objective(3.0, y);
        sys
    }

    #[test]
    fn test_cbc_solves_small_system() {
        let sys = sample();
        let solution = CbcBackend.solve(&sys).unwrap();
        assert_eq!(solution.objective.round() as i64, 37);
        assert_eq!(solution.count(VarId(0)), 1);
        assert_eq!(solution.count(VarId(1)), 10);
    }

    #[test]
    fn test_solution_is_feasible() {
        let sys = sample();
        let solution = CbcBackend.solve(&sys).unwrap();
        let mut values = AHashMap::new();
        values.insert(VarId(0), solution.value(VarId(0)));
        values.insert(VarId(1), solution.value(VarId(1)));
        assert!(feasible(&sys, &values));
    }

    #[test]
    fn test_backend_lookup() {
        assert!(backend_by_name("cbc").is_ok());
        assert!(backend_by_name("simplex9000").is_err());
    }
}
