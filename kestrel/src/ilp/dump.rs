//! Textual dumps of an ILP system.
//!
//! Four formats are supported: the default human-readable listing (one
//! constraint per line with a leading label), lp_solve, CPLEX LP and the
//! MOSEK tag-bracket syntax. Variable names are escaped so that only
//! `[A-Za-z_][A-Za-z0-9_]*` identifiers reach the target tool; original
//! names are preserved in comments where the format allows them.

use super::{System, VarId, VarType};
use ahash::AHashMap;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    Default,
    LpSolve,
    Cplex,
    Mosek,
}

impl DumpFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "default" => Some(DumpFormat::Default),
            "lp_solve" | "lpsolve" | "lp" => Some(DumpFormat::LpSolve),
            "cplex" => Some(DumpFormat::Cplex),
            "mosek" => Some(DumpFormat::Mosek),
            _ => None,
        }
    }
}

/// Escapes an identifier to `[A-Za-z_][A-Za-z0-9_]*`; offending bytes
/// become `_xx` hex escapes.
pub fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, b) in name.bytes().enumerate() {
        let ok = b == b'_'
            || b.is_ascii_alphabetic()
            || (b.is_ascii_digit() && i > 0);
        if ok {
            out.push(b as char);
        } else {
            out.push('_');
            out.push_str(&format!("{:02x}", b));
        }
    }
    out
}

/// Name assistant: escapes, renames anonymous variables and optionally
/// forces `xN` renaming for picky targets.
struct Dumper {
    force_rename: bool,
    renamed: AHashMap<u32, String>,
    count: u32,
}

impl Dumper {
    fn new(force_rename: bool) -> Self {
        Self {
            force_rename,
            renamed: AHashMap::new(),
            count: 0,
        }
    }

    fn name(&mut self, sys: &System, var: VarId) -> String {
        let raw = &sys.var(var).name;
        if !raw.is_empty() && !self.force_rename {
            return escape_name(raw);
        }
        self.renamed
            .entry(var.0)
            .or_insert_with(|| {
                let n = format!("x{}", self.count);
                self.count += 1;
                n
            })
            .clone()
    }
}

fn fmt_coef(coef: f64) -> String {
    if (coef - coef.round()).abs() < 1e-9 {
        format!("{}", coef.round() as i64)
    } else {
        format!("{}", coef)
    }
}

fn fmt_term(sys: &System, dumper: &mut Dumper, var: VarId, coef: f64, first: bool) -> String {
    let name = dumper.name(sys, var);
    let sign = if coef < 0.0 {
        "- "
    } else if first {
        ""
    } else {
        "+ "
    };
    let mag = coef.abs();
    if (mag - 1.0).abs() < 1e-9 {
        format!("{}{}", sign, name)
    } else {
        format!("{}{} {}", sign, fmt_coef(mag), name)
    }
}

pub fn dump(sys: &System, format: DumpFormat, out: &mut dyn Write) -> io::Result<()> {
    match format {
        DumpFormat::Default => dump_default(sys, out),
        DumpFormat::LpSolve => dump_lp_solve(sys, out),
        DumpFormat::Cplex => dump_cplex(sys, out),
        DumpFormat::Mosek => dump_mosek(sys, out),
    }
}

/// One constraint per line, leading label.
fn dump_default(sys: &System, out: &mut dyn Write) -> io::Result<()> {
    let mut dumper = Dumper::new(false);
    let goal = if sys.is_maximize() { "maximize" } else { "minimize" };
    let obj = sys
        .objective()
        .iter()
        .enumerate()
        .map(|(i, &(v, c))| fmt_term(sys, &mut dumper, v, c, i == 0))
        .collect::<Vec<_>>()
        .join(" ");
    writeln!(out, "{}: {}", goal, obj)?;

    for cons in sys.constraints() {
        let label = cons.label.as_deref().unwrap_or("_");
        let terms = cons
            .terms
            .iter()
            .enumerate()
            .map(|(i, &(v, c))| fmt_term(sys, &mut dumper, v, c, i == 0))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(
            out,
            "{}: {} {} {}",
            label,
            terms,
            cons.comp.symbol(),
            fmt_coef(cons.constant)
        )?;
    }
    Ok(())
}

/// lp_solve format: `max:` header, `;` terminators, positive terms left of
/// the comparator and negatives moved right.
fn dump_lp_solve(sys: &System, out: &mut dyn Write) -> io::Result<()> {
    let mut dumper = Dumper::new(false);

    writeln!(out, "max:")?;
    for (i, &(v, c)) in sys.objective().iter().enumerate() {
        writeln!(out, " {}", fmt_term(sys, &mut dumper, v, c, i == 0))?;
    }
    writeln!(out, ";")?;
    writeln!(out)?;

    for cons in sys.constraints() {
        let mut line = String::new();
        let mut first = true;
        let mut any_pos = false;
        for &(v, c) in &cons.terms {
            if c > 0.0 {
                if !first {
                    line.push(' ');
                }
                line.push_str(&fmt_term(sys, &mut dumper, v, c, first));
                first = false;
                any_pos = true;
            }
        }
        if !any_pos {
            line.push('0');
        }
        if cons.constant < 0.0 {
            line.push_str(&format!(" + {}", fmt_coef(-cons.constant)));
        }

        line.push_str(&format!(" {}", cons.comp.symbol()));

        let mut any_neg = false;
        first = true;
        for &(v, c) in &cons.terms {
            if c < 0.0 {
                line.push(' ');
                line.push_str(&fmt_term(sys, &mut dumper, v, -c, first));
                first = false;
                any_neg = true;
            }
        }
        if cons.constant > 0.0 || (cons.constant == 0.0 && !any_neg) {
            if any_neg {
                line.push_str(" +");
            }
            line.push_str(&format!(" {}", fmt_coef(cons.constant.max(0.0))));
        }

        line.push(';');
        if let Some(label) = &cons.label {
            line.push_str(&format!("\t/* {} */", label));
        }
        writeln!(out, "{}", line)?;
    }
    writeln!(out)?;

    for (i, var) in sys.vars().iter().enumerate() {
        let keyword = match var.ty {
            VarType::Int => "int",
            VarType::Bin => "bin",
            VarType::Float => continue,
        };
        writeln!(out, "{} {};", keyword, dumper.name(sys, VarId(i as u32)))?;
    }
    Ok(())
}

/// CPLEX LP format with forced renaming; original names survive in the
/// `General` section comments.
fn dump_cplex(sys: &System, out: &mut dyn Write) -> io::Result<()> {
    let mut dumper = Dumper::new(true);

    writeln!(out, "Maximize")?;
    for &(v, c) in sys.objective() {
        writeln!(out, " {}", fmt_term(sys, &mut dumper, v, c, false))?;
    }
    writeln!(out)?;

    writeln!(out, "Subject To")?;
    for (i, cons) in sys.constraints().iter().enumerate() {
        let terms = cons
            .terms
            .iter()
            .map(|&(v, c)| fmt_term(sys, &mut dumper, v, c, false))
            .collect::<Vec<_>>()
            .join(" ");
        let mut line = format!(
            "lbl{}: {} {} {}",
            i + 1,
            terms,
            cons.comp.symbol(),
            fmt_coef(cons.constant)
        );
        if let Some(label) = &cons.label {
            line.push_str(&format!("\t\\* {} *\\", label));
        }
        writeln!(out, "{}", line)?;
    }
    writeln!(out)?;

    writeln!(out, "Bounds")?;
    for (i, _) in sys.vars().iter().enumerate() {
        writeln!(out, " 0 <= {}", dumper.name(sys, VarId(i as u32)))?;
    }
    writeln!(out)?;

    writeln!(out, "General")?;
    for (i, var) in sys.vars().iter().enumerate() {
        if var.ty == VarType::Float {
            continue;
        }
        writeln!(
            out,
            " {}\t\\* {} *\\",
            dumper.name(sys, VarId(i as u32)),
            var.name
        )?;
    }
    writeln!(out)?;
    writeln!(out, "End")?;
    Ok(())
}

/// MOSEK tag-bracket syntax with forced renaming.
fn dump_mosek(sys: &System, out: &mut dyn Write) -> io::Result<()> {
    let mut dumper = Dumper::new(true);

    writeln!(out, "[objective maximize 'obj']")?;
    let mut line = String::new();
    for &(v, c) in sys.objective() {
        if c == 0.0 {
            continue;
        }
        line.push_str(&format!(" {}", fmt_term(sys, &mut dumper, v, c, false)));
    }
    writeln!(out, "{}", line)?;
    writeln!(out, "[/objective]")?;

    writeln!(out, "[constraints]")?;
    for cons in sys.constraints() {
        let terms = cons
            .terms
            .iter()
            .map(|&(v, c)| fmt_term(sys, &mut dumper, v, c, false))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(
            out,
            "[con] {} {} {} [/con]",
            terms,
            cons.comp.symbol(),
            fmt_coef(cons.constant)
        )?;
    }
    writeln!(out, "[/constraints]")?;

    writeln!(out, "[bounds]")?;
    writeln!(out, "[b] 0 <= * [/b]")?;
    writeln!(out, "[/bounds]")?;

    writeln!(out, "[variables]")?;
    for (i, _) in sys.vars().iter().enumerate() {
        writeln!(out, " {}", dumper.name(sys, VarId(i as u32)))?;
    }
    writeln!(out, "[/variables]")?;

    writeln!(out, "[integer]")?;
    for (i, var) in sys.vars().iter().enumerate() {
        if var.ty != VarType::Float {
            writeln!(out, " {}", dumper.name(sys, VarId(i as u32)))?;
        }
    }
    writeln!(out, "[/integer]")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ilp::Comp;

    fn sample() -> System {
        let mut sys = System::maximize();
        let x = sys.new_var("x_main", VarType::Int);
        let y = sys.new_var("x_loop@0x100", VarType::Int);

        let c = sys.new_constraint(Some("entry".into()), Comp::Eq, 1.0);
        sys.add_term(c, x, 1.0);
        let b = sys.new_constraint(Some("loop bound".into()), Comp::Le, 0.0);
        sys.add_term(b, y, 1.0);
        sys.add_term(b, x, -10.0);

        sys.add_objective(7.0, x);
        sys.add_objective(3.0, y);
        sys
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape_name("x_main"), "x_main");
        assert_eq!(escape_name("x@1"), "x_401");
        assert_eq!(escape_name("1x"), "_31x");
        assert!(escape_name("x_loop@0x100")
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn test_default_format() {
        let sys = sample();
        let mut buf = Vec::new();
        dump(&sys, DumpFormat::Default, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("maximize: 7 x_main + 3 x_loop_400x100"));
        assert!(text.contains("entry: x_main = 1"));
        assert!(text.contains("loop bound:"));
    }

    #[test]
    fn test_lp_solve_format() {
        let sys = sample();
        let mut buf = Vec::new();
        dump(&sys, DumpFormat::LpSolve, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("max:\n"));
        // negatives moved right of the comparator
        assert!(text.contains("x_loop_400x100 <= 10 x_main;"));
        assert!(text.contains("int x_main;"));
        assert!(text.contains("/* loop bound */"));
    }

    #[test]
    fn test_cplex_format() {
        let sys = sample();
        let mut buf = Vec::new();
        dump(&sys, DumpFormat::Cplex, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        for section in ["Maximize", "Subject To", "Bounds", "General", "End"] {
            assert!(text.contains(section), "missing section {}", section);
        }
        // renamed but documented
        assert!(text.contains("x0"));
        assert!(text.contains("x_loop@0x100"));
    }

    #[test]
    fn test_mosek_format() {
        let sys = sample();
        let mut buf = Vec::new();
        dump(&sys, DumpFormat::Mosek, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("[objective maximize 'obj']"));
        assert!(text.contains("[con]"));
        assert!(text.contains("[b] 0 <= * [/b]"));
        assert!(text.contains("[/integer]"));
    }

    #[test]
    fn test_format_names() {
        assert_eq!(DumpFormat::from_name("lp_solve"), Some(DumpFormat::LpSolve));
        assert_eq!(DumpFormat::from_name("CPLEX"), Some(DumpFormat::Cplex));
        assert_eq!(DumpFormat::from_name("nope"), None);
    }
}
