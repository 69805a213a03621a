//! Reduction and production of program state.
//!
//! Only the instruction list and program counter cross the wire; the
//! function jump tables and source map are rebuilt by the load prepass on
//! the receiving side.

use svi_core::State;
use svi_io::WireMap;

use crate::context::WireContext;
use crate::error::WireResult;
use crate::isa::{produce_program, reduce_program};
use crate::keys;

/// Reduce a state to its wire map.
pub fn reduce_state(state: &State, ctx: &mut dyn WireContext) -> WireResult<WireMap> {
    let mut map = WireMap::new();
    map.set_map(keys::INSTRUCTIONS, reduce_program(state.instructions(), ctx)?);
    map.set_u64(keys::PC, state.pc() as u64);
    Ok(map)
}

/// Produce a state from its wire map.
pub fn produce_state(map: &WireMap, ctx: &mut dyn WireContext) -> WireResult<State> {
    let instructions = produce_program(map.get_map(keys::INSTRUCTIONS)?, ctx)?;
    let pc = map.get_u64(keys::PC)? as usize;
    Ok(State::from_parts(instructions, pc)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NullContext;
    use svi_core::parser;

    #[test]
    fn state_round_trips_with_rebuilt_tables() {
        let program = parser::parse(
            "
            beginfn f:inc p:NUMBER
              fnparam p:NUMBER $l:x
              $l:r <- plus $l:x 1
              return $l:r
            out \"ready\"
            ",
        )
        .unwrap();

        let mut state = State::new(program).unwrap();
        state.jump(4).unwrap();

        let mut ctx = NullContext;
        let map = reduce_state(&state, &mut ctx).unwrap();
        let produced = produce_state(&map, &mut ctx).unwrap();

        assert_eq!(produced.pc(), 4);
        assert_eq!(produced.instructions(), state.instructions());
        // The prepass rebuilt the jump tables.
        assert_eq!(
            produced.function_entry("inc").unwrap(),
            state.function_entry("inc").unwrap()
        );
    }
}
