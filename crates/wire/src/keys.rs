//! Stable numeric field keys used inside reduced maps.
//!
//! These values are part of the exchange format; never renumber them.

pub const TAG: u8 = 0;
pub const FIRST: u8 = 1;
pub const SECOND: u8 = 2;
pub const THIRD: u8 = 3;
pub const IS_PURE: u8 = 4;
pub const TYPE: u8 = 5;
pub const BODY: u8 = 6;
pub const AFFINITY: u8 = 7;
pub const NAME: u8 = 8;
pub const ID: u8 = 9;
pub const INTRINSIC: u8 = 10;
pub const BACKEND: u8 = 11;
pub const RETURNS: u8 = 12;
pub const PARAMS: u8 = 13;
pub const VALUE: u8 = 14;
pub const EXTRA: u8 = 15;
pub const VECTOR_TYPES: u8 = 16;
pub const VECTOR_VALUES: u8 = 17;
pub const HAS_PARENT: u8 = 18;
pub const LOCATIONS: u8 = 19;
pub const EX_HANDLERS: u8 = 20;
pub const PARENT: u8 = 21;
pub const HAS_CALL: u8 = 22;
pub const CALL: u8 = 23;
pub const HAS_RETURN: u8 = 24;
pub const RETURN: u8 = 25;
pub const HAS_RETURN_PC: u8 = 26;
pub const RETURN_PC: u8 = 27;
pub const IS_EX_FRAME: u8 = 28;
pub const CAPTURE_RETURN: u8 = 29;
pub const INSTRUCTIONS: u8 = 32;
pub const PC: u8 = 33;
pub const LENGTH: u8 = 35;
pub const FINAL: u8 = 36;
pub const OTYPE_K: u8 = 37;
pub const OTYPE_V: u8 = 38;
pub const OWNER: u8 = 40;
pub const CATEGORY: u8 = 41;
pub const KEYS: u8 = 42;
pub const ITEMS: u8 = 43;
pub const SELECTOR: u8 = 44;
pub const CODE: u8 = 45;
pub const DISCRIMINATOR: u8 = 46;
pub const HANDLER: u8 = 47;
pub const FILE: u8 = 48;
pub const LINE: u8 = 49;
pub const COL: u8 = 50;

/// Selector kinds inside serialized exception handlers.
pub const SELECTOR_UNIVERSAL: u64 = 0;
pub const SELECTOR_CODE: u64 = 1;
pub const SELECTOR_DISCRIMINATOR: u64 = 2;
