//! Program state: the loaded instruction list and position tracking.
//!
//! A one-pass scan over the instructions records, for every `beginfn`, both
//! the entry position (first instruction after the header and its formal
//! parameters) and the position just past its matching `return`, so that
//! sequential execution can hop over embedded function bodies while calls
//! jump straight to the entry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{SviError, SviResult};
use crate::instructions::{Instruction, Instructions, Position, Tag};
use crate::references::{LocationReference, Reference};
use crate::scope::ScopeFrame;

/// Loaded instructions plus the program counter and jump tables.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    instructions: Instructions,
    pc: usize,
    rewind_to_head: bool,
    function_jumps: HashMap<String, usize>,
    function_skips: HashMap<String, usize>,
    source_map: BTreeMap<usize, Position>,
}

impl State {
    /// Load a program and build the function and source tables.
    pub fn new(instructions: Instructions) -> SviResult<Self> {
        let mut state = Self {
            instructions,
            pc: 0,
            rewind_to_head: false,
            function_jumps: HashMap::new(),
            function_skips: HashMap::new(),
            source_map: BTreeMap::new(),
        };
        state.annotate()?;
        Ok(state)
    }

    /// Rebuild a state from serialized parts.
    pub fn from_parts(instructions: Instructions, pc: usize) -> SviResult<Self> {
        let mut state = Self::new(instructions)?;
        state.pc = pc;
        Ok(state)
    }

    fn annotate(&mut self) -> SviResult<()> {
        let mut open: Vec<(String, usize)> = Vec::new();

        for (pc, instruction) in self.instructions.iter().enumerate() {
            match instruction {
                Instruction::Position(position) => {
                    self.source_map.insert(pc + 1, position.clone());
                }
                Instruction::BeginFn { function, .. } => {
                    open.push((function.name().to_string(), pc));
                }
                Instruction::Return0 | Instruction::Return1 { .. } => {
                    if let Some((name, header_pc)) = open.pop() {
                        // Entry skips the header and its formal parameters;
                        // those are bound from the call vector.
                        let mut entry = header_pc + 1;
                        while matches!(
                            self.instructions.get(entry),
                            Some(Instruction::FnParam { .. })
                        ) {
                            entry += 1;
                        }
                        self.function_jumps.insert(name.clone(), entry);
                        self.function_skips.insert(name, pc + 1);
                    }
                }
                _ => {}
            }
        }

        if let Some((name, _)) = open.pop() {
            return Err(SviError::malformed(format!(
                "function f:{name} has no matching return"
            )));
        }

        Ok(())
    }

    pub fn instructions(&self) -> &Instructions {
        &self.instructions
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    /// The current instruction, or `None` past the end of the program.
    pub fn current(&self) -> Option<&Instruction> {
        if self.rewind_to_head {
            return self.instructions.first();
        }
        self.instructions.get(self.pc)
    }

    /// Look up a specific instruction.
    pub fn lookup(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(pc)
    }

    /// True when no instructions remain.
    pub fn is_end_of_program(&self) -> bool {
        self.pc >= self.instructions.len()
    }

    /// Advance to the next instruction.
    pub fn advance(&mut self) -> SviResult<()> {
        if self.is_end_of_program() {
            return Err(SviError::malformed("cannot advance beyond end of program"));
        }
        if self.rewind_to_head {
            self.pc = 0;
            self.rewind_to_head = false;
            return Ok(());
        }
        self.pc += 1;
        Ok(())
    }

    /// Step back to the previous instruction.
    pub fn rewind(&mut self) {
        if self.pc < 1 {
            self.rewind_to_head = true;
            return;
        }
        self.pc -= 1;
    }

    /// Jump to a specific position.
    pub fn jump(&mut self, pc: usize) -> SviResult<()> {
        if pc > self.instructions.len() {
            return Err(SviError::malformed(format!(
                "cannot jump to {pc}: program has {} instructions",
                self.instructions.len()
            )));
        }
        self.rewind_to_head = false;
        self.pc = pc;
        Ok(())
    }

    /// Jump past the last instruction.
    pub fn jump_end(&mut self) {
        self.pc = self.instructions.len();
        self.rewind_to_head = false;
    }

    /// Jump into a call, recording the current position as the return
    /// position on the given scope frame.
    pub fn jump_call(&mut self, scope: &mut ScopeFrame, pc: usize) -> SviResult<()> {
        scope.set_return_pc(self.pc);
        self.jump(pc)
    }

    /// Jump to the return position of the innermost call on the scope
    /// chain, clearing it.
    pub fn jump_return(&mut self, scope: &mut ScopeFrame) -> SviResult<()> {
        match scope.take_return_pc() {
            Some(pc) => self.jump(pc),
            None => Err(SviError::malformed(
                "cannot make return jump: the call stack is empty",
            )),
        }
    }

    // --- inline function tables ---

    /// Entry position of the named inline function.
    pub fn function_entry(&self, name: &str) -> SviResult<usize> {
        self.function_jumps.get(name).copied().ok_or_else(|| {
            SviError::malformed(format!("unable to find entry for inline function f:{name}"))
        })
    }

    /// Position just past the named function's `return`.
    pub fn function_skip(&self, name: &str) -> SviResult<usize> {
        self.function_skips.get(name).copied().ok_or_else(|| {
            SviError::malformed(format!("unable to find skip for inline function f:{name}"))
        })
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.function_jumps.contains_key(name)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &String> {
        self.function_jumps.keys()
    }

    /// The `beginfn` header for the named function.
    pub fn function_header(&self, name: &str) -> SviResult<&Instruction> {
        let entry = self.function_entry(name)?;
        // Walk back past the formal parameters to the header itself.
        let mut pc = entry;
        loop {
            if pc == 0 {
                break;
            }
            pc -= 1;
            match self.instructions.get(pc) {
                Some(Instruction::FnParam { .. }) => continue,
                Some(header @ Instruction::BeginFn { .. }) => return Ok(header),
                _ => break,
            }
        }
        Err(SviError::malformed(format!(
            "no beginfn header found for f:{name}"
        )))
    }

    /// The formal parameters of the named function, in declaration order.
    pub fn function_params(&self, name: &str) -> SviResult<Vec<(Reference, LocationReference)>> {
        let entry = self.function_entry(name)?;
        let mut params = Vec::new();
        let mut pc = entry;
        while pc > 0 {
            pc -= 1;
            match self.instructions.get(pc) {
                Some(Instruction::FnParam {
                    param_type,
                    location,
                }) => params.push((param_type.clone(), location.clone())),
                _ => break,
            }
        }
        params.reverse();
        Ok(params)
    }

    // --- source mapping ---

    /// The source position annotated for the instruction at `pc`, if any.
    pub fn position_for(&self, pc: usize) -> Option<&Position> {
        self.source_map.get(&pc)
    }

    /// The nearest annotated position at or before `pc`.
    pub fn nearest_position(&self, pc: usize) -> Option<&Position> {
        self.source_map.range(..=pc).next_back().map(|(_, p)| p)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "State<pc: {}, #instructions: {}, #functions: {}>",
            self.pc,
            self.instructions.len(),
            self.function_jumps.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::references::Affinity;

    fn fn_loc(name: &str) -> LocationReference {
        LocationReference::new(Affinity::Function, name)
    }

    fn local(name: &str) -> LocationReference {
        LocationReference::new(Affinity::Local, name)
    }

    fn sample_program() -> Instructions {
        vec![
            // 0
            Instruction::BeginFn {
                function: fn_loc("inc"),
                returns: Reference::TypeRef(crate::types::Type::Number),
                pure: false,
            },
            // 1
            Instruction::FnParam {
                param_type: Reference::TypeRef(crate::types::Type::Number),
                location: local("x"),
            },
            // 2
            Instruction::Plus {
                lhs: Reference::Location(local("x")),
                rhs: Reference::Number(1.0),
            },
            // 3
            Instruction::Return0,
            // 4
            Instruction::Out {
                value: Reference::StringVal("done".into()),
            },
        ]
    }

    #[test]
    fn prepass_builds_jump_tables() {
        let state = State::new(sample_program()).unwrap();
        assert_eq!(state.function_entry("inc").unwrap(), 2);
        assert_eq!(state.function_skip("inc").unwrap(), 4);
        assert!(state.has_function("inc"));
        assert!(state.function_entry("missing").is_err());
    }

    #[test]
    fn function_params_in_declaration_order() {
        let state = State::new(sample_program()).unwrap();
        let params = state.function_params("inc").unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].1.name(), "x");
    }

    #[test]
    fn unterminated_function_is_rejected() {
        let program = vec![Instruction::BeginFn {
            function: fn_loc("broken"),
            returns: Reference::TypeRef(crate::types::Type::Void),
            pure: false,
        }];
        assert!(State::new(program).is_err());
    }

    #[test]
    fn jump_call_and_return_round_trip() {
        let mut state = State::new(sample_program()).unwrap();
        let mut scope = ScopeFrame::root("root");
        state.jump(4).unwrap();

        state.jump_call(&mut scope, 2).unwrap();
        assert_eq!(state.pc(), 2);
        state.jump_return(&mut scope).unwrap();
        assert_eq!(state.pc(), 4);
        assert!(state.jump_return(&mut scope).is_err());
    }

    #[test]
    fn rewind_at_head_replays_first_instruction() {
        let mut state = State::new(sample_program()).unwrap();
        state.rewind();
        assert_eq!(state.current(), state.lookup(0));
        state.advance().unwrap();
        assert_eq!(state.pc(), 0);
    }

    #[test]
    fn position_annotations_map_to_following_instruction() {
        let program = vec![
            Instruction::Position(Position {
                file: "main.sw".into(),
                line: 3,
                col: 1,
            }),
            Instruction::Out {
                value: Reference::Number(1.0),
            },
        ];
        let state = State::new(program).unwrap();
        assert_eq!(state.position_for(1).map(|p| p.line), Some(3));
        assert!(state.position_for(0).is_none());
        assert_eq!(state.nearest_position(1).map(|p| p.line), Some(3));
    }
}
