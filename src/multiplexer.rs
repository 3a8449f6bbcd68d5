//! Cooperative scheduling of many parsers in one thread.
//!
//! Parsers whose next result needs no blocking read ("avid" parsers:
//! finished ones, buffered lookahead, or memory/file sources) are drained
//! round-robin first. The rest are process-backed; their line channels go
//! into a [`crossbeam_channel::Select`] and whichever becomes readable first
//! is driven next. Within one parser results keep source order; across
//! parsers the order is whatever readiness dictates.

use crossbeam_channel::Select;

use crate::parser::Parser;
use crate::result::ParseResult;

struct Slot<T> {
    parser: Parser,
    stash: T,
}

/// One scheduling decision out of [`Multiplexer::next_ready`].
pub enum Mux<'a, T> {
    /// A parser produced a result; the stash rides along so the caller can
    /// route it (e.g. to the right formatter session).
    Item(&'a mut Parser, &'a mut T, ParseResult),
    /// A parser reached end of stream. It is removed from the set and handed
    /// back, finalized, exactly once.
    Done(Parser, T),
}

/// Schedules up to `jobs` live parsers, each with an opaque stash.
pub struct Multiplexer<T> {
    slots: Vec<Slot<T>>,
    rr: usize,
}

impl<T> Multiplexer<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            rr: 0,
        }
    }

    /// Register a parser with its stash.
    pub fn add(&mut self, parser: Parser, stash: T) {
        self.slots.push(Slot { parser, stash });
    }

    /// Number of parsers currently in flight.
    pub fn parsers(&self) -> usize {
        self.slots.len()
    }

    /// Drive whichever parser is ready next. Returns `None` once the set is
    /// empty.
    pub fn next_ready(&mut self) -> Option<Mux<'_, T>> {
        if self.slots.is_empty() {
            return None;
        }
        let index = self.pick();
        match self.slots[index].parser.next_result() {
            Some(result) => {
                let slot = &mut self.slots[index];
                Some(Mux::Item(&mut slot.parser, &mut slot.stash, result))
            }
            None => {
                let slot = self.slots.remove(index);
                Some(Mux::Done(slot.parser, slot.stash))
            }
        }
    }

    /// Pick the slot to drive: avid parsers round-robin, otherwise block on
    /// readiness selection over the process-backed channels.
    fn pick(&mut self) -> usize {
        let count = self.slots.len();
        for offset in 0..count {
            let index = (self.rr + offset) % count;
            if self.slots[index].parser.is_avid() {
                self.rr = (index + 1) % count;
                return index;
            }
        }

        // Every slot is process-backed and idle; wait for one to wake up.
        let mut select = Select::new();
        let mut registered = Vec::with_capacity(count);
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(receiver) = slot.parser.select_recv() {
                select.recv(receiver);
                registered.push(index);
            }
        }
        registered[select.ready()]
    }
}

impl<T> Default for Multiplexer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    #[test]
    fn interleaves_but_keeps_per_parser_order() {
        let mut mux = Multiplexer::new();
        mux.add(Parser::from_tap("1..2\nok 1\nok 2\n"), "a");
        mux.add(Parser::from_tap("1..1\nnot ok 1\n"), "b");
        assert_eq!(mux.parsers(), 2);

        let mut seen: Vec<(String, String)> = Vec::new();
        let mut done = Vec::new();
        while let Some(event) = mux.next_ready() {
            match event {
                Mux::Item(_, stash, result) => {
                    seen.push((stash.to_string(), result.raw().to_owned()));
                }
                Mux::Done(parser, stash) => {
                    done.push((stash, parser.summary()));
                }
            }
        }
        assert_eq!(mux.parsers(), 0);

        let of = |tag: &str| -> Vec<String> {
            seen.iter()
                .filter(|(t, _)| t == tag)
                .map(|(_, raw)| raw.clone())
                .collect()
        };
        assert_eq!(of("a"), vec!["1..2", "ok 1", "ok 2"]);
        assert_eq!(of("b"), vec!["1..1", "not ok 1"]);

        done.sort_by(|(a, _), (b, _)| a.cmp(b));
        assert_eq!(done.len(), 2);
        assert!(!done[0].1.has_problems());
        assert!(done[1].1.has_problems());
    }

    #[test]
    fn empty_set_is_end() {
        let mut mux: Multiplexer<()> = Multiplexer::new();
        assert!(mux.next_ready().is_none());
    }
}
