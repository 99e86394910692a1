// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Append-only program builder with elapsed-time bookkeeping.

use std::fmt;

use crate::instructions::{Instruction, MAX_WAIT_TIME, MIN_WAIT_TIME};
use crate::{Error, NanoSeconds, Result};

#[derive(Debug, Clone, PartialEq)]
struct Line {
    label: Option<String>,
    instruction: Instruction,
    comment: Option<String>,
}

/// A sequencer program under construction.
///
/// `elapsed_time` tracks the real-time duration of the emitted instructions
/// so the generator can derive the wait needed to reach an absolute
/// schedule time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    lines: Vec<Line>,
    elapsed_time: NanoSeconds,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed_time(&self) -> NanoSeconds {
        self.elapsed_time
    }

    pub fn num_instructions(&self) -> usize {
        self.lines.len()
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.lines.iter().map(|line| &line.instruction)
    }

    pub fn emit(&mut self, instruction: Instruction) {
        self.elapsed_time += instruction.duration();
        self.lines.push(Line {
            label: None,
            instruction,
            comment: None,
        });
    }

    pub fn emit_with_comment<S: Into<String>>(&mut self, instruction: Instruction, comment: S) {
        self.elapsed_time += instruction.duration();
        self.lines.push(Line {
            label: None,
            instruction,
            comment: Some(comment.into()),
        });
    }

    /// Attach a label to the next emitted instruction.
    pub fn emit_labeled<S: Into<String>>(&mut self, label: S, instruction: Instruction) {
        self.elapsed_time += instruction.duration();
        self.lines.push(Line {
            label: Some(label.into()),
            instruction,
            comment: None,
        });
    }

    /// Emit a wait of arbitrary grid-aligned length, splitting it into
    /// multiple `wait` instructions when it exceeds the immediate size.
    ///
    /// The split never leaves a remainder below the minimal wait time; the
    /// final full-size chunk is shortened instead.
    pub fn auto_wait(&mut self, duration: NanoSeconds) -> Result<()> {
        self.auto_wait_with_comment(duration, None)
    }

    pub fn auto_wait_with_comment(
        &mut self,
        duration: NanoSeconds,
        comment: Option<&str>,
    ) -> Result<()> {
        if duration == 0 {
            return Ok(());
        }
        if duration < MIN_WAIT_TIME {
            return Err(Error::WaitTooShort {
                duration,
                min: MIN_WAIT_TIME,
            });
        }
        let mut remaining = duration;
        let mut first = true;
        while remaining > MAX_WAIT_TIME {
            let chunk = if remaining - MAX_WAIT_TIME < MIN_WAIT_TIME {
                MAX_WAIT_TIME - MIN_WAIT_TIME
            } else {
                MAX_WAIT_TIME
            };
            self.emit_wait(chunk, first.then_some(comment).flatten());
            remaining -= chunk;
            first = false;
        }
        self.emit_wait(remaining, first.then_some(comment).flatten());
        Ok(())
    }

    fn emit_wait(&mut self, duration: NanoSeconds, comment: Option<&str>) {
        match comment {
            Some(comment) => self.emit_with_comment(Instruction::Wait { duration }, comment),
            None => self.emit(Instruction::Wait { duration }),
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            if let Some(label) = &line.label {
                writeln!(f, "{label}:")?;
            }
            let rendered = line.instruction.to_string();
            match &line.comment {
                Some(comment) => {
                    let (name, args) = rendered.split_once(' ').unwrap_or((&rendered, ""));
                    writeln!(f, " {name:<14}{args:<18}# {comment}")?;
                }
                None => {
                    let (name, args) = rendered.split_once(' ').unwrap_or((&rendered, ""));
                    if args.is_empty() {
                        writeln!(f, " {name}")?;
                    } else {
                        writeln!(f, " {name:<14}{args}")?;
                    }
                }
            }
        }
        Ok(())
    }
}
