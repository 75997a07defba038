use indoc::indoc;
use pretty_assertions::assert_eq;

use super::*;
use crate::{
    cfg::{
        analysis::query_reachability_through_back_edges,
        node::{MergeInfo, MergeType, TerminatorKind},
    },
    lir::{Instruction, parser::Parser, pretty_print::print_module_plain},
};

fn parse(source: &str) -> Module {
    Parser::parse_module(source).unwrap()
}

fn structurize(source: &str) -> String {
    let mut module = parse(source);
    structurize_module(&mut module, &StructurizerOptions::default()).unwrap();
    assert_phis_match_predecessors(&module);
    print_module_plain(&module)
}

/// Every PHI names each incoming edge of its block exactly once
fn assert_phis_match_predecessors(module: &Module) {
    for function in &module.functions {
        for block in &function.layout {
            let mut predecessors = function.predecessors(*block);
            predecessors.sort();

            for phi in function.phis(*block) {
                let Instruction::Phi { sources, .. } = function.instruction(phi) else {
                    panic!("expected a phi");
                };

                let mut incoming = sources.iter().map(|(block, _)| *block).collect::<Vec<_>>();
                incoming.sort();

                assert_eq!(
                    incoming,
                    predecessors,
                    "phi sources of `{}` don't match its predecessors",
                    function.block_name(*block)
                );
            }
        }
    }
}

/// Structurizes the only function of `source`, checking both the PHIs and
/// the constructs. Returns the plain text of the result.
fn structurize_checked(source: &str) -> String {
    let mut module = parse(source);
    let cfg = structurize_function(&mut module.functions[0], &StructurizerOptions::default()).unwrap();

    assert_phis_match_predecessors(&module);
    assert_constructs_are_closed(&cfg);
    print_module_plain(&module)
}

/// Loops name a merge and a continue block, selections name a merge unless
/// they end the function. Every block named is reachable from its header.
fn assert_constructs_are_closed(cfg: &StructurizedCfg) {
    let reaches = |from: NodeId, to: NodeId| query_reachability_through_back_edges(&cfg.pool, from, to);

    for id in cfg.pool.live_nodes() {
        let node = cfg.pool.node(id);

        match node.merge {
            MergeType::None => {}
            MergeType::Loop => {
                let MergeInfo {
                    merge_block: Some(merge),
                    continue_block: Some(continue_block),
                } = node.ir.merge_info
                else {
                    panic!("loop `{}` lacks a merge or continue block", node.name);
                };

                assert!(reaches(id, merge), "loop `{}` can't reach its merge", node.name);
                assert!(reaches(id, continue_block), "loop `{}` can't reach its continue", node.name);
            }
            MergeType::Selection => match node.selection_merge_block {
                Some(merge) => assert!(reaches(id, merge), "selection `{}` can't reach its merge", node.name),
                None if node.selection_merge_exit => assert!(
                    node.succ.iter().any(|target| matches!(
                        cfg.pool.node(*target).ir.terminator.kind(),
                        TerminatorKind::Unreachable | TerminatorKind::Kill
                    )),
                    "exit selection `{}` has no arm leaving the function",
                    node.name
                ),
                // Arms which only end the function merge at a fake block
                None => {}
            },
        }
    }
}

#[test]
fn diamond_gets_a_selection_merge() {
    let output = structurize(indoc! {"
        fn f(%0) {
        entry:
            br %0, left, right
        left:
            %1 = add %0, 1
            jmp join
        right:
            %2 = add %0, 2
            jmp join
        join:
            %3 = phi(left -> %1, right -> %2)
            ret %3
        }
    "});

    assert_eq!(
        output,
        indoc! {"
            fn f(%0) {
            entry:
                call @cfg.selection_merge(label join)
                br %0, left, right
            left:
                %1 = add %0, 1
                jmp join
            right:
                %2 = add %0, 2
                jmp join
            join:
                %3 = phi(left -> %1, right -> %2)
                call @cfg.merge_block()
                ret %3
            }
        "}
    );
}

#[test]
fn natural_loop_gets_a_loop_merge() {
    let output = structurize(indoc! {"
        fn f(%0) {
        entry:
            jmp header
        header:
            %1 = phi(entry -> 0, body -> %2)
            %3 = lt %1, %0
            br %3, body, exit
        body:
            %2 = add %1, 1
            jmp header
        exit:
            ret %1
        }
    "});

    assert_eq!(
        output,
        indoc! {"
            fn f(%0) {
            entry:
                jmp header
            header:
                %1 = phi(entry -> 0, body -> %2)
                %3 = lt %1, %0
                call @cfg.loop_merge(label exit, label body)
                br %3, body, exit
            body:
                %2 = add %1, 1
                call @cfg.continue_block()
                jmp header
            exit:
                call @cfg.merge_block()
                ret %1
            }
        "}
    );
}

#[test]
fn nested_selections_sharing_a_merge_get_a_ladder() {
    let output = structurize(indoc! {"
        fn f(%0, %1) {
        entry:
            br %0, outer_then, outer_else
        outer_then:
            br %1, a, b
        a:
            %2 = add %0, 1
            jmp join
        b:
            %3 = add %0, 2
            jmp join
        outer_else:
            %4 = add %0, 3
            jmp join
        join:
            %5 = phi(a -> %2, b -> %3, outer_else -> %4)
            ret %5
        }
    "});

    assert_eq!(
        output,
        indoc! {"
            fn f(%0, %1) {
            entry:
                call @cfg.selection_merge(label join)
                br %0, outer_then, outer_else
            outer_then:
                call @cfg.selection_merge(label join.selection_ladder)
                br %1, a, b
            a:
                %2 = add %0, 1
                jmp join.selection_ladder
            b:
                %3 = add %0, 2
                jmp join.selection_ladder
            outer_else:
                %4 = add %0, 3
                jmp join
            join.selection_ladder:
                %6 = phi(a -> %2, b -> %3)
                call @cfg.merge_block()
                jmp join
            join:
                %5 = phi(outer_else -> %4, join.selection_ladder -> %6)
                call @cfg.merge_block()
                ret %5
            }
        "}
    );
}

#[test]
fn multiple_back_edges_share_a_continue_block() {
    let output = structurize(indoc! {"
        fn f(%0, %1) {
        entry:
            jmp header
        header:
            %2 = phi(entry -> 0, a -> %3, b -> %4)
            br %0, a, b
        a:
            %3 = add %2, 1
            br %1, header, exit
        b:
            %4 = add %2, 2
            jmp header
        exit:
            ret %2
        }
    "});

    assert!(output.contains("%2 = phi(entry -> 0, header.continue -> %5)\n"));
    assert!(output.contains("call @cfg.loop_merge(label exit, label header.continue)\n"));
    assert!(output.contains("br %1, header.continue, exit\n"));
    assert!(output.contains(indoc! {"
        header.continue:
            %5 = phi(a -> %3, b -> %4)
            call @cfg.continue_block()
            jmp header
    "}));

    // The header branches into its own body, which needs a selection of
    // its own
    assert!(output.contains(indoc! {"
        header.fake_selection:
            call @cfg.selection_merge(label header.unreachable)
            br %0, a, b
        header.unreachable:
            call @cfg.merge_block()
            unreachable
    "}));
}

#[test]
fn selection_with_a_discarding_arm_merges_into_the_other_arm() {
    let output = structurize(indoc! {"
        fn f(%0) {
        entry:
            br %0, bad, good
        bad:
            call @cfg.discard_fragment()
            unreachable
        good:
            ret
        }
    "});

    assert!(output.contains(indoc! {"
        entry:
            call @cfg.selection_merge(label good)
            br %0, bad, good
    "}));
    assert!(output.contains(indoc! {"
        good:
            call @cfg.merge_block()
            ret
    "}));
}

#[test]
fn duplicate_switch_targets_keep_one_incoming_per_predecessor() {
    let mut module = parse(indoc! {"
        fn f(%0) {
        entry:
            switch %0, join, [1: join, 2: other]
        other:
            %1 = add %0, 1
            jmp join
        join:
            %2 = phi(entry -> 7, entry -> 7, other -> %1)
            ret %2
        }
    "});

    let cfg = structurize_function(&mut module.functions[0], &StructurizerOptions::default()).unwrap();

    let join = cfg
        .pool
        .live_nodes()
        .into_iter()
        .find(|id| cfg.pool.node(*id).name == "join")
        .unwrap();

    let incoming = &cfg.pool.node(join).ir.phi[0].incoming;
    assert_eq!(incoming.len(), 2);
    assert_eq!(cfg.pool.node(join).pred.len(), 2);

    // Written back once per edge
    assert_phis_match_predecessors(&module);
    assert!(print_module_plain(&module).contains("call @cfg.selection_merge(label join)\n"));
}

#[test]
fn irreducible_loop_is_rejected() {
    let mut module = parse(indoc! {"
        fn f(%0) {
        entry:
            br %0, a, b
        a:
            %1 = add %0, 1
            jmp b
        b:
            %2 = add %0, 2
            jmp a
        }
    "});

    let error = structurize_function(&mut module.functions[0], &StructurizerOptions::default()).unwrap_err();

    assert_eq!(
        error,
        CfgError::IrreducibleLoop {
            header: "a".to_owned(),
            latch: "b".to_owned(),
        }
    );
}

#[test]
fn annotations_can_be_disabled() {
    let source = indoc! {"
        fn f(%0) {
        entry:
            br %0, left, right
        left:
            %1 = add %0, 1
            jmp join
        right:
            %2 = add %0, 2
            jmp join
        join:
            %3 = phi(left -> %1, right -> %2)
            ret %3
        }
    "};

    let mut module = parse(source);
    let options = StructurizerOptions {
        add_merge_annotations: false,
        ..StructurizerOptions::default()
    };

    structurize_module(&mut module, &options).unwrap();

    assert_eq!(print_module_plain(&module), source);
}

#[test]
fn writing_back_twice_changes_nothing() {
    let mut module = parse(indoc! {"
        fn f(%0, %1) {
        entry:
            jmp header
        header:
            %2 = phi(entry -> 0, a -> %3, b -> %4)
            br %0, a, b
        a:
            %3 = add %2, 1
            br %1, header, exit
        b:
            %4 = add %2, 2
            jmp header
        exit:
            ret %2
        }
    "});

    let options = StructurizerOptions::default();
    let function = &mut module.functions[0];
    let mut pool = CfgNodePool::new();

    let mut translator = CfgTranslator::run(function, &mut pool, &options.markers).unwrap();
    let entry = Structurizer::new(function, &mut pool, translator.entry(), &options)
        .run()
        .unwrap();

    translator.cfg_to_lir(function, &mut pool, entry, true).unwrap();
    let first = print_module_plain(&module);

    let function = &mut module.functions[0];
    translator.cfg_to_lir(function, &mut pool, entry, true).unwrap();

    assert_eq!(print_module_plain(&module), first);
}

#[test]
fn entry_loop_header_gets_a_new_entry() {
    let output = structurize(indoc! {"
        fn f(%0) {
        entry:
            %1 = add %0, 1
            br %0, entry, exit
        exit:
            ret %1
        }
    "});

    // The old entry is now a loop header behind a new entry block
    assert!(output.starts_with(indoc! {"
        fn f(%0) {
        entry.pred:
            jmp entry
    "}));
    assert!(output.contains("call @cfg.loop_merge(label exit, label entry.continue)\n"));
}

#[test]
fn dot_marks_back_and_merge_edges() {
    let mut module = parse(indoc! {"
        fn f(%0) {
        entry:
            jmp header
        header:
            br %0, body, exit
        body:
            %1 = add %0, 1
            jmp header
        exit:
            ret
        }
    "});

    let cfg = structurize_function(&mut module.functions[0], &StructurizerOptions::default()).unwrap();
    let dot = cfg.to_dot("f");

    assert!(dot.contains("\"body\" -> \"header\" [style=dashed];"));
    assert!(dot.contains("\"header\" -> \"exit\" [style=dotted, label=merge];"));
    assert!(dot.contains("\"header\" -> \"body\" [style=dotted, label=continue];"));
}

#[test]
fn diamond_with_empty_arms_keeps_its_arms() {
    let output = structurize_checked(indoc! {"
        fn f(%0) {
        A:
            br %0, B, C
        B:
            jmp D
        C:
            jmp D
        D:
            ret
        }
    "});

    assert_eq!(
        output,
        indoc! {"
            fn f(%0) {
            A:
                call @cfg.selection_merge(label D)
                br %0, B, C
            B:
                jmp D
            C:
                jmp D
            D:
                call @cfg.merge_block()
                ret
            }
        "}
    );
}

#[test]
fn fake_merge_of_the_entry_selection_stays_behind_the_entry() {
    let mut module = parse(indoc! {"
        fn f(%0, %1) {
        entry:
            br %0, a, d
        a:
            %2 = add %0, 1
            br %1, c, d
        c:
            ret %2
        d:
            ret
        }
    "});

    structurize_module(&mut module, &StructurizerOptions::default()).unwrap();

    let function = &module.functions[0];
    let entry = function.entry_block().unwrap();
    assert_eq!(function.block_name(entry), "entry");

    assert!(print_module_plain(&module).starts_with(indoc! {"
        fn f(%0, %1) {
        entry:
            call @cfg.selection_merge(label entry.fake_merge)
            br %0, a, d
        entry.fake_merge:
            call @cfg.merge_block()
            unreachable
    "}));
}

#[test]
fn too_many_passes_is_an_error() {
    let mut module = parse(indoc! {"
        fn f(%0, %1) {
        entry:
            br %0, outer_then, outer_else
        outer_then:
            br %1, a, b
        a:
            %2 = add %0, 1
            jmp join
        b:
            %3 = add %0, 2
            jmp join
        outer_else:
            %4 = add %0, 3
            jmp join
        join:
            %5 = phi(a -> %2, b -> %3, outer_else -> %4)
            ret %5
        }
    "});

    // The ladder takes a second pass to settle
    let options = StructurizerOptions {
        max_passes: 1,
        ..StructurizerOptions::default()
    };

    let error = structurize_function(&mut module.functions[0], &options).unwrap_err();

    assert_eq!(error, CfgError::NoConvergence { passes: 1 });
}

#[test]
fn kill_block_shared_by_two_loops_is_duplicated() {
    let output = structurize_checked(indoc! {"
        fn f(%0, %1) {
        entry:
            jmp a
        a:
            br %0, a_body, b
        a_body:
            br %1, kill, a_latch
        a_latch:
            jmp a
        b:
            br %0, b_body, exit
        b_body:
            br %1, kill, b_latch
        b_latch:
            jmp b
        kill:
            call @cfg.discard_fragment()
            unreachable
        exit:
            ret
        }
    "});

    assert!(output.contains(indoc! {"
        a_body:
            call @cfg.selection_merge(label kill)
            br %1, kill, a_latch
    "}));
    assert!(output.contains(indoc! {"
        b_body:
            call @cfg.selection_merge(label kill.dup)
            br %1, kill.dup, b_latch
    "}));
    assert!(output.contains(indoc! {"
        kill.dup:
            call @cfg.discard_fragment()
            call @cfg.merge_block()
            unreachable
    "}));
}

#[test]
fn loop_exits_without_a_shared_merge_go_through_a_selector() {
    let output = structurize_checked(indoc! {"
        fn f(%0, %1, %2) {
        entry:
            switch %0, header, [1: left, 2: join]
        header:
            br %1, body, left
        body:
            %3 = add %0, 1
            br %2, right, latch
        latch:
            jmp header
        left:
            ret %0
        right:
            %4 = add %3, 1
            jmp join
        join:
            ret %1
        }
    "});

    assert!(output.contains("call @cfg.loop_merge(label header.loop_merge_ladder, label latch)\n"));
    assert!(output.contains("br %1, body, header.loop_merge_ladder\n"));
    assert!(output.contains("br %2, header.loop_merge_ladder, latch\n"));

    // `right` is no longer dominated by `body`, so %3 reaches it through a
    // PHI in the ladder
    assert!(output.contains(indoc! {"
        header.loop_merge_ladder:
            %5 = phi(header -> true, body -> false)
            %6 = phi(header -> undef, body -> %3)
    "}));
    assert!(output.contains(indoc! {"
        right:
            %4 = add %6, 1
            jmp join
    "}));
}

#[test]
fn switch_in_a_loop_header_moves_into_its_own_block() {
    let output = structurize_checked(indoc! {"
        fn f(%0) {
        entry:
            jmp header
        header:
            %1 = phi(entry -> 0, latch -> %2)
            switch %0, exit, [1: a, 2: b]
        a:
            %3 = add %1, 1
            jmp latch
        b:
            %4 = add %1, 2
            jmp latch
        latch:
            %2 = phi(a -> %3, b -> %4)
            jmp header
        exit:
            ret %1
        }
    "});

    assert!(output.contains(indoc! {"
        header:
            %1 = phi(entry -> 0, latch -> %2)
            call @cfg.loop_merge(label exit, label latch)
            jmp header.succ
        header.succ:
            call @cfg.selection_merge(label latch.selection_ladder)
            switch %0, exit, [1: a, 2: b]
    "}));

    // The switch can't merge at the continue block directly
    assert!(output.contains(indoc! {"
        latch.selection_ladder:
            %5 = phi(a -> %3, b -> %4)
            call @cfg.merge_block()
            jmp latch
        latch:
            %2 = phi(latch.selection_ladder -> %5)
            call @cfg.continue_block()
            jmp header
    "}));
}

#[test]
fn switch_merging_outside_its_region_gets_a_ladder() {
    let output = structurize_checked(indoc! {"
        fn f(%0, %1) {
        entry:
            br %0, sw, c
        sw:
            switch %1, a, [1: b]
        a:
            %2 = add %0, 1
            jmp join
        b:
            %3 = add %0, 2
            jmp join
        c:
            %4 = add %0, 3
            jmp join
        join:
            %5 = phi(a -> %2, b -> %3, c -> %4)
            ret %5
        }
    "});

    assert_eq!(
        output,
        indoc! {"
            fn f(%0, %1) {
            entry:
                call @cfg.selection_merge(label join)
                br %0, sw, c
            sw:
                call @cfg.selection_merge(label join.switch_merge)
                switch %1, a, [1: b]
            a:
                %2 = add %0, 1
                jmp join.switch_merge
            b:
                %3 = add %0, 2
                jmp join.switch_merge
            c:
                %4 = add %0, 3
                jmp join
            join.switch_merge:
                %6 = phi(a -> %2, b -> %3)
                call @cfg.merge_block()
                jmp join
            join:
                %5 = phi(c -> %4, join.switch_merge -> %6)
                call @cfg.merge_block()
                ret %5
            }
        "}
    );
}

#[test]
fn break_out_of_two_loops_gets_a_break_ladder() {
    let output = structurize_checked(indoc! {"
        fn f(%0, %1, %2) {
        entry:
            jmp outer
        outer:
            br %0, inner, exit
        inner:
            br %1, inner_body, exit
        inner_body:
            br %2, inner_latch, outer_latch
        inner_latch:
            jmp inner
        outer_latch:
            jmp outer
        exit:
            ret
        }
    "});

    assert!(output.contains("call @cfg.loop_merge(label exit, label outer_latch)\n"));
    assert!(output.contains(indoc! {"
        inner:
            call @cfg.loop_merge(label exit.break_ladder, label inner_latch)
            br %1, inner_body, exit.break_ladder
    "}));
    assert!(output.contains(indoc! {"
        exit.break_ladder:
            call @cfg.merge_block()
            jmp exit
    "}));
}

#[test]
fn inner_loop_breaking_past_the_outer_loop_settles() {
    let output = structurize_checked(indoc! {"
        fn f(%0, %1, %2) {
        entry:
            switch %0, outer, [1: left, 2: right]
        outer:
            br %1, inner, left
        inner:
            br %2, inner_body, right
        inner_body:
            br %1, inner_latch, outer_latch
        inner_latch:
            jmp inner
        outer_latch:
            jmp outer
        left:
            ret %0
        right:
            ret %1
        }
    "});

    // Both loops leave through the outer selector, the inner one by way of
    // its own break ladder
    assert!(output.contains("call @cfg.loop_merge(label outer.loop_merge_ladder, label outer_latch)\n"));
    assert!(output.contains(
        "call @cfg.loop_merge(label outer.loop_merge_ladder.break_ladder, label inner_latch)\n"
    ));
    assert!(!output.contains("right.transposed_ladder"));
}
