// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Balancing, reordering and batching of a collected event list.
//!
//! At flush time the per-request collector holds events in physical emission
//! order, which for asynchronous work is not tree order. The assembler
//! closes abandoned spans, re-serializes the list as a depth-first
//! linearization of the span tree and splits the result into fixed-size
//! batches for egress. Both balancing and reordering are idempotent.

use std::collections::HashMap;

use serde::Serialize;

use crate::event::Phase;
use crate::event::ScopeId;
use crate::event::SpanId;
use crate::event::TraceEvent;

/// Append a synthetic exit for every enter with no matching exit in the
/// remaining list. Synthetic exits carry `unawaited = true`, a depth one
/// less than their enter and empty return/error fields; a missing exit is a
/// normal condition, not an error.
pub fn balance(events: &mut Vec<TraceEvent>) {
    let mut open: Vec<usize> = Vec::new();
    let mut exits: HashMap<SpanId, usize> = HashMap::new();

    for (idx, event) in events.iter().enumerate() {
        match event.phase {
            Phase::Enter => open.push(idx),
            Phase::Exit => {
                *exits.entry(event.span_id).or_default() += 1;
            }
        }
    }

    let mut synthetic = Vec::new();
    for idx in open {
        let enter = &events[idx];
        match exits.get_mut(&enter.span_id) {
            Some(count) if *count > 0 => *count -= 1,
            _ => {
                let mut exit = enter.clone();
                exit.phase = Phase::Exit;
                exit.depth = enter.depth.saturating_sub(1);
                exit.args = None;
                exit.ret = None;
                exit.error = None;
                exit.threw = false;
                exit.unawaited = true;
                synthetic.push(exit);
            }
        }
    }
    // Abandoned spans close innermost-first.
    synthetic.reverse();
    events.extend(synthetic);
}

struct Node {
    enter: Option<usize>,
    exits: Vec<usize>,
    children: Vec<SpanId>,
    first_index: usize,
}

/// Reorganize the list into a valid depth-first linearization of the span
/// tree. Children are ordered by first emission; depths are rewritten to
/// tree depth; events without a span id keep their original positions.
pub fn reorder(events: Vec<TraceEvent>) -> Vec<TraceEvent> {
    let mut nodes: HashMap<SpanId, Node> = HashMap::new();
    let mut anchored: Vec<(usize, TraceEvent)> = Vec::new();

    for (idx, event) in events.iter().enumerate() {
        if !event.has_span() {
            anchored.push((idx, event.clone()));
            continue;
        }
        let node = nodes.entry(event.span_id).or_insert(Node {
            enter: None,
            exits: Vec::new(),
            children: Vec::new(),
            first_index: idx,
        });
        match event.phase {
            Phase::Enter => {
                if node.enter.is_none() {
                    node.enter = Some(idx);
                }
            }
            Phase::Exit => node.exits.push(idx),
        }
    }

    // Parent edges come from the enter events.
    let mut roots: Vec<SpanId> = Vec::new();
    let mut span_ids: Vec<SpanId> = nodes.keys().copied().collect();
    span_ids.sort_by_key(|id| nodes[id].first_index);
    for span_id in &span_ids {
        let parent = nodes[span_id]
            .enter
            .and_then(|idx| events[idx].parent_span_id)
            .filter(|parent| nodes.contains_key(parent));
        match parent {
            Some(parent) => nodes.get_mut(&parent).unwrap().children.push(*span_id),
            None => roots.push(*span_id),
        }
    }

    let mut out = Vec::with_capacity(events.len());
    for root in roots {
        serialize_span(root, 1, &nodes, &events, &mut out);
    }

    // Span-less events return to their original offsets.
    for (idx, event) in anchored {
        let at = idx.min(out.len());
        out.insert(at, event);
    }
    out
}

fn serialize_span(
    span_id: SpanId,
    depth: usize,
    nodes: &HashMap<SpanId, Node>,
    events: &[TraceEvent],
    out: &mut Vec<TraceEvent>,
) {
    let node = &nodes[&span_id];
    if let Some(enter_idx) = node.enter {
        let mut enter = events[enter_idx].clone();
        enter.depth = depth;
        out.push(enter);
    }
    for child in &node.children {
        serialize_span(*child, depth + 1, nodes, events, out);
    }
    for exit_idx in &node.exits {
        let mut exit = events[*exit_idx].clone();
        exit.depth = depth;
        out.push(exit);
    }
}

/// One egress chunk of the reordered list.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceBatch {
    pub scope_id: ScopeId,
    pub index: usize,
    pub total: usize,
    pub events: Vec<TraceEvent>,
}

/// Split the reordered list into fixed-size chunks tagged with their index
/// and the chunk count.
pub fn batch(scope_id: ScopeId, events: Vec<TraceEvent>, size: usize) -> Vec<TraceBatch> {
    let size = size.max(1);
    let total = events.len().div_ceil(size);
    let mut chunks: Vec<Vec<TraceEvent>> = Vec::with_capacity(total);
    let mut rest = events;
    while rest.len() > size {
        let tail = rest.split_off(size);
        chunks.push(std::mem::replace(&mut rest, tail));
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, events)| TraceBatch {
            scope_id,
            index,
            total,
            events,
        })
        .collect()
}
