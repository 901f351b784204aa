//! Graphviz dumps of CFGs and execution graphs.

use crate::cfg::{Cfg, EdgeKind};
use crate::exegraph::{EdgeType, ExeGraph};
use crate::hard::Processor;
use std::fmt::Write;

fn quote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Renders one CFG as a dot digraph.
pub fn cfg_to_dot(cfg: &Cfg) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{}\" {{", quote(cfg.name()));
    let _ = writeln!(out, "  node [shape=box, fontname=\"monospace\"];");

    for n in cfg.blocks() {
        let block = cfg.block(n);
        let label = if block.is_entry() {
            "entry".to_string()
        } else if block.is_exit() {
            "exit".to_string()
        } else if block.is_synth() {
            match block.callee() {
                Some(c) => format!("call #{}", c.0),
                None => "call ?".to_string(),
            }
        } else {
            let mut s = String::new();
            for inst in block.insts() {
                let _ = writeln!(s, "{:#x}", inst.address());
            }
            s
        };
        let _ = writeln!(out, "  n{} [label=\"{}\"];", n.index(), quote(&label));
    }

    for e in cfg.graph.edge_indices() {
        let (src, dst) = cfg.endpoints(e);
        let style = match cfg.edge(e).kind {
            EdgeKind::Taken => "label=\"taken\"",
            EdgeKind::NotTaken => "label=\"not-taken\"",
            EdgeKind::Call => "label=\"call\", style=dashed",
            EdgeKind::Return => "label=\"return\", style=dashed",
            EdgeKind::Virtual => "style=dotted",
        };
        let _ = writeln!(out, "  n{} -> n{} [{}];", src.index(), dst.index(), style);
    }

    let _ = writeln!(out, "}}");
    out
}

/// Renders an execution graph: one row per instruction, one column per
/// stage, slashed edges dashed.
pub fn exegraph_to_dot(g: &ExeGraph, proc: &Processor) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph exegraph {{");
    let _ = writeln!(out, "  node [shape=record, fontname=\"monospace\"];");

    for (i, node) in g.nodes.iter().enumerate() {
        let stage = &proc.stages[node.stage];
        let fu = node
            .fu
            .and_then(|f| stage.fus.get(f))
            .map(|f| format!("/{}", f.name))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "  n{} [label=\"I{} {}{} | [{}, {}]\"];",
            i, node.inst, stage.name, fu, node.times.finish.min, node.times.finish.max
        );
    }

    for e in &g.edges {
        let style = match e.ty {
            EdgeType::Solid => "solid",
            EdgeType::Slashed => "dashed",
        };
        let _ = writeln!(
            out,
            "  n{} -> n{} [style={}, label=\"{}\"];",
            e.src.index(),
            e.dst.index(),
            style,
            e.latency
        );
    }

    let _ = writeln!(out, "}}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Block;
    use crate::exegraph::{builder::SeqInst, CodePart, ExeGraphBuilder};
    use crate::prog::{Inst, InstKind};

    #[test]
    fn test_cfg_dot() {
        let mut cfg = Cfg::new("main", 0x100);
        let bb = cfg.add_block(Block::basic(vec![Inst::new(0x100, 4, InstKind::ALU)]));
        cfg.add_edge(cfg.entry(), bb, EdgeKind::Virtual);
        cfg.add_edge(bb, cfg.exit(), EdgeKind::Return);

        let dot = cfg_to_dot(&cfg);
        assert!(dot.starts_with("digraph \"main\""));
        assert!(dot.contains("0x100"));
        assert!(dot.contains("label=\"return\""));
    }

    #[test]
    fn test_exegraph_dot() {
        let proc = Processor::scalar(5);
        let seq = vec![SeqInst {
            inst: Inst::new(0x100, 4, InstKind::ALU),
            part: CodePart::Body,
        }];
        let (g, _) = ExeGraphBuilder::new(&proc).build(&seq);
        let dot = exegraph_to_dot(&g, &proc);
        assert!(dot.contains("digraph exegraph"));
        assert!(dot.contains("I0 FE"));
    }
}
