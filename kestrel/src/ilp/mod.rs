//! ILP system model.
//!
//! A [`System`] collects integer variables, linear constraints and an
//! objective; it is either handed to a solver back-end ([`solver`]) or
//! dumped in one of the supported textual formats ([`dump`]).

pub mod dump;
pub mod solver;

pub use dump::DumpFormat;
pub use solver::{backend_by_name, CbcBackend, IlpBackend, IlpSolution};

/// Variable handle inside one system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub u32);

/// Constraint handle inside one system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Int,
    Float,
    Bin,
}

#[derive(Debug, Clone)]
pub struct Var {
    pub name: String,
    pub ty: VarType,
}

/// Constraint comparator. Strict comparators are kept for completeness;
/// back-ends over integers treat them as their loose counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl Comp {
    pub fn symbol(self) -> &'static str {
        match self {
            Comp::Lt => "<",
            Comp::Le => "<=",
            Comp::Eq => "=",
            Comp::Ge => ">=",
            Comp::Gt => ">",
        }
    }
}

/// Linear constraint `Σ coef·var  comp  constant`.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub label: Option<String>,
    pub comp: Comp,
    pub constant: f64,
    pub terms: Vec<(VarId, f64)>,
}

/// One ILP: variables, constraints and the objective.
#[derive(Debug, Clone)]
pub struct System {
    vars: Vec<Var>,
    cons: Vec<Constraint>,
    objective: Vec<(VarId, f64)>,
    maximize: bool,
}

impl System {
    pub fn maximize() -> Self {
        Self {
            vars: Vec::new(),
            cons: Vec::new(),
            objective: Vec::new(),
            maximize: true,
        }
    }

    pub fn minimize() -> Self {
        Self {
            maximize: false,
            ..Self::maximize()
        }
    }

    pub fn is_maximize(&self) -> bool {
        self.maximize
    }

    pub fn new_var(&mut self, name: impl Into<String>, ty: VarType) -> VarId {
        self.vars.push(Var {
            name: name.into(),
            ty,
        });
        VarId(self.vars.len() as u32 - 1)
    }

    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id.0 as usize]
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    pub fn new_constraint(
        &mut self,
        label: Option<String>,
        comp: Comp,
        constant: f64,
    ) -> ConsId {
        self.cons.push(Constraint {
            label,
            comp,
            constant,
            terms: Vec::new(),
        });
        ConsId(self.cons.len() as u32 - 1)
    }

    /// Adds `coef·var` to the left side of the constraint, merging the
    /// coefficient if the variable already appears.
    pub fn add_term(&mut self, cons: ConsId, var: VarId, coef: f64) {
        let c = &mut self.cons[cons.0 as usize];
        if let Some(t) = c.terms.iter_mut().find(|(v, _)| *v == var) {
            t.1 += coef;
        } else {
            c.terms.push((var, coef));
        }
    }

    /// Shifts the constraint's right-hand constant.
    pub fn add_constant(&mut self, cons: ConsId, delta: f64) {
        self.cons[cons.0 as usize].constant += delta;
    }

    pub fn constraint(&self, id: ConsId) -> &Constraint {
        &self.cons[id.0 as usize]
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.cons
    }

    pub fn cons_count(&self) -> usize {
        self.cons.len()
    }

    pub fn add_objective(&mut self, coef: f64, var: VarId) {
        if let Some(t) = self.objective.iter_mut().find(|(v, _)| *v == var) {
            t.1 += coef;
        } else {
            self.objective.push((var, coef));
        }
    }

    pub fn objective(&self) -> &[(VarId, f64)] {
        &self.objective
    }
}
