//! Parser for the textual SVI form.
//!
//! The grammar is line-oriented but whitespace-insensitive: a token stream
//! of opcodes, operands, and `<-` assignment arrows. Operand counts per
//! opcode are fixed except for the polyadic forms (`return`, `call`,
//! `callif`, `callelse`, `pushcall*`, `strslice`, `pushexhandler`), which
//! are disambiguated by counting reference-leader tokens ahead of the next
//! opcode or assignment.

use crate::error::{SviError, SviResult};
use crate::instructions::{Instruction, Instructions, Position};
use crate::references::{Affinity, LocationReference, Reference};
use crate::types::Type;

/// Split SVI source into tokens: whitespace-separated words, with `--`
/// comments stripped and string literals kept as single tokens (quotes
/// included, escapes resolved).
pub fn tokenize(source: &str) -> SviResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut token = String::new();
    let mut chars = source.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some('n') => token.push('\n'),
                    Some(escaped) => token.push(escaped),
                    None => return Err(SviError::malformed("unterminated escape in string")),
                },
                '"' => {
                    token.push('"');
                    tokens.push(std::mem::take(&mut token));
                    in_string = false;
                }
                other => token.push(other),
            }
            continue;
        }

        match c {
            '"' => {
                if !token.is_empty() {
                    tokens.push(std::mem::take(&mut token));
                }
                token.push('"');
                in_string = true;
            }
            '-' => {
                if chars.peek() == Some(&'-') {
                    // Comment: skip to end of line.
                    if !token.is_empty() {
                        tokens.push(std::mem::take(&mut token));
                    }
                    for skipped in chars.by_ref() {
                        if skipped == '\n' {
                            break;
                        }
                    }
                } else {
                    token.push('-');
                }
            }
            c if c.is_whitespace() => {
                if !token.is_empty() {
                    tokens.push(std::mem::take(&mut token));
                }
            }
            other => token.push(other),
        }
    }

    if in_string {
        return Err(SviError::malformed("unterminated string literal"));
    }
    if !token.is_empty() {
        tokens.push(token);
    }

    Ok(tokens)
}

/// Parse SVI source into an instruction list.
pub fn parse(source: &str) -> SviResult<Instructions> {
    let tokens = tokenize(source)?;
    parse_tokens(&tokens)
}

/// Parse a pre-tokenized stream.
pub fn parse_tokens(tokens: &[String]) -> SviResult<Instructions> {
    let mut instructions = Vec::new();
    let mut at = 0;
    while at < tokens.len() {
        at += parse_one(&mut instructions, tokens, at)?;
    }
    Ok(instructions)
}

fn parse_one(is: &mut Instructions, tokens: &[String], at: usize) -> SviResult<usize> {
    let token = &tokens[at];
    let leader = token
        .chars()
        .next()
        .ok_or_else(|| SviError::malformed("empty token"))?;

    if leader == '$' {
        parse_assignment(is, tokens, at)
    } else if leader.is_alphabetic() || leader == '.' {
        parse_instruction(is, tokens, at)
    } else {
        Err(SviError::malformed(format!(
            "invalid token `{token}` (expected assignment or instruction)"
        )))
    }
}

fn expect<'a>(tokens: &'a [String], at: usize, mnemonic: &str) -> SviResult<&'a str> {
    tokens.get(at).map(String::as_str).ok_or_else(|| {
        SviError::malformed(format!("malformed instruction `{mnemonic}` (unexpected EOF)"))
    })
}

fn parse_operand(tokens: &[String], at: usize, mnemonic: &str) -> SviResult<Reference> {
    parse_reference(expect(tokens, at, mnemonic)?)
}

fn parse_location_operand(
    tokens: &[String],
    at: usize,
    mnemonic: &str,
) -> SviResult<LocationReference> {
    let token = expect(tokens, at, mnemonic)?;
    match parse_reference(token)? {
        Reference::Location(loc) => Ok(loc),
        _ => Err(SviError::malformed(format!(
            "malformed instruction `{mnemonic}` (expected location, got `{token}`)"
        ))),
    }
}

fn parse_objprop_operand(
    tokens: &[String],
    at: usize,
    mnemonic: &str,
) -> SviResult<LocationReference> {
    let loc = parse_location_operand(tokens, at, mnemonic)?;
    if loc.affinity() != Affinity::ObjectProp {
        return Err(SviError::malformed(format!(
            "malformed instruction `{mnemonic}` (expected object property, got affinity `{}`)",
            loc.affinity()
        )));
    }
    Ok(loc)
}

fn parse_instruction(is: &mut Instructions, tokens: &[String], at: usize) -> SviResult<usize> {
    let mnemonic = tokens[at].as_str();
    let args = at + 1;
    let mut consumed = 1usize;

    macro_rules! refs {
        ($i:expr) => {
            parse_operand(tokens, args + $i, mnemonic)?
        };
    }
    macro_rules! loc {
        ($i:expr) => {
            parse_location_operand(tokens, args + $i, mnemonic)?
        };
    }
    macro_rules! prop {
        ($i:expr) => {
            parse_objprop_operand(tokens, args + $i, mnemonic)?
        };
    }

    let instruction = match mnemonic {
        ".position" => {
            let file = match refs!(0) {
                Reference::StringVal(s) => s,
                other => {
                    return Err(SviError::malformed(format!(
                        "malformed .position annotation (expected string, got {other})"
                    )))
                }
            };
            let line = expect_number(refs!(1), ".position line")?;
            let col = expect_number(refs!(2), ".position col")?;
            consumed += 3;
            Instruction::Position(Position {
                file,
                line: line as u64,
                col: col as u64,
            })
        }
        "beginfn" => {
            let function = loc!(0);
            let returns = refs!(1);
            consumed += 2;
            Instruction::BeginFn {
                function,
                returns,
                pure: false,
            }
        }
        "fnparam" => {
            let i = Instruction::FnParam {
                param_type: refs!(0),
                location: loc!(1),
            };
            consumed += 2;
            i
        }
        "return" => {
            if count_operands(tokens, args) < 1 {
                Instruction::Return0
            } else {
                let i = Instruction::Return1 { value: refs!(0) };
                consumed += 1;
                i
            }
        }
        "curry" => {
            let i = Instruction::Curry {
                function: refs!(0),
                arg: refs!(1),
            };
            consumed += 2;
            i
        }
        "call" => {
            if count_operands(tokens, args) < 2 {
                let i = Instruction::Call0 { function: refs!(0) };
                consumed += 1;
                i
            } else {
                let i = Instruction::Call1 {
                    function: refs!(0),
                    arg: refs!(1),
                };
                consumed += 2;
                i
            }
        }
        "callif" => {
            if count_operands(tokens, args) < 3 {
                let i = Instruction::CallIf0 {
                    condition: refs!(0),
                    function: refs!(1),
                };
                consumed += 2;
                i
            } else {
                let i = Instruction::CallIf1 {
                    condition: refs!(0),
                    function: refs!(1),
                    arg: refs!(2),
                };
                consumed += 3;
                i
            }
        }
        "callelse" => {
            if count_operands(tokens, args) < 3 {
                let i = Instruction::CallElse0 {
                    condition: refs!(0),
                    function: refs!(1),
                };
                consumed += 2;
                i
            } else {
                let i = Instruction::CallElse1 {
                    condition: refs!(0),
                    function: refs!(1),
                    arg: refs!(2),
                };
                consumed += 3;
                i
            }
        }
        "pushcall" => {
            if count_operands(tokens, args) < 2 {
                let i = Instruction::PushCall0 { function: refs!(0) };
                consumed += 1;
                i
            } else {
                let i = Instruction::PushCall1 {
                    function: refs!(0),
                    arg: refs!(1),
                };
                consumed += 2;
                i
            }
        }
        "pushcallif" => {
            if count_operands(tokens, args) < 3 {
                let i = Instruction::PushCallIf0 {
                    condition: refs!(0),
                    function: refs!(1),
                };
                consumed += 2;
                i
            } else {
                let i = Instruction::PushCallIf1 {
                    condition: refs!(0),
                    function: refs!(1),
                    arg: refs!(2),
                };
                consumed += 3;
                i
            }
        }
        "pushcallelse" => {
            if count_operands(tokens, args) < 3 {
                let i = Instruction::PushCallElse0 {
                    condition: refs!(0),
                    function: refs!(1),
                };
                consumed += 2;
                i
            } else {
                let i = Instruction::PushCallElse1 {
                    condition: refs!(0),
                    function: refs!(1),
                    arg: refs!(2),
                };
                consumed += 3;
                i
            }
        }
        "drain" => Instruction::Drain,
        "retmaphas" => {
            let i = Instruction::RetMapHas {
                map: refs!(0),
                key: refs!(1),
            };
            consumed += 2;
            i
        }
        "retmapget" => {
            let i = Instruction::RetMapGet {
                map: refs!(0),
                key: refs!(1),
            };
            consumed += 2;
            i
        }
        "entercontext" => Instruction::EnterContext,
        "resumecontext" => {
            let i = Instruction::ResumeContext { context: refs!(0) };
            consumed += 1;
            i
        }
        "popcontext" => Instruction::PopContext,
        "exit" => Instruction::Exit,
        "out" => {
            let i = Instruction::Out { value: refs!(0) };
            consumed += 1;
            i
        }
        "err" => {
            let i = Instruction::Err { value: refs!(0) };
            consumed += 1;
            i
        }
        "streaminit" => {
            let i = Instruction::StreamInit {
                stream_type: refs!(0),
            };
            consumed += 1;
            i
        }
        "streampush" => {
            let i = Instruction::StreamPush {
                stream: loc!(0),
                value: refs!(1),
            };
            consumed += 2;
            i
        }
        "streampop" => {
            let i = Instruction::StreamPop { stream: loc!(0) };
            consumed += 1;
            i
        }
        "streamclose" => {
            let i = Instruction::StreamClose { stream: loc!(0) };
            consumed += 1;
            i
        }
        "streamempty" => {
            let i = Instruction::StreamEmpty { stream: loc!(0) };
            consumed += 1;
            i
        }
        "typify" => {
            let i = Instruction::Typify {
                location: loc!(0),
                type_value: refs!(1),
            };
            consumed += 2;
            i
        }
        "lock" => {
            let i = Instruction::Lock { location: loc!(0) };
            consumed += 1;
            i
        }
        "unlock" => {
            let i = Instruction::Unlock { location: loc!(0) };
            consumed += 1;
            i
        }
        "equal" => {
            let i = Instruction::IsEqual {
                lhs: refs!(0),
                rhs: refs!(1),
            };
            consumed += 2;
            i
        }
        "scopeof" => {
            let i = Instruction::ScopeOf { location: loc!(0) };
            consumed += 1;
            i
        }
        "typeof" => {
            let i = Instruction::TypeOf { value: refs!(0) };
            consumed += 1;
            i
        }
        "compatible" => {
            let i = Instruction::IsCompatible {
                lhs: refs!(0),
                rhs: refs!(1),
            };
            consumed += 2;
            i
        }
        "and" | "or" | "xor" | "nand" | "nor" => {
            let lhs = refs!(0);
            let rhs = refs!(1);
            consumed += 2;
            match mnemonic {
                "and" => Instruction::And { lhs, rhs },
                "or" => Instruction::Or { lhs, rhs },
                "xor" => Instruction::Xor { lhs, rhs },
                "nand" => Instruction::Nand { lhs, rhs },
                _ => Instruction::Nor { lhs, rhs },
            }
        }
        "not" => {
            let i = Instruction::Not { value: refs!(0) };
            consumed += 1;
            i
        }
        "mapinit" => {
            let i = Instruction::MapInit {
                value_type: refs!(0),
            };
            consumed += 1;
            i
        }
        "mapset" => {
            let i = Instruction::MapSet {
                key: refs!(0),
                value: refs!(1),
                map: loc!(2),
            };
            consumed += 3;
            i
        }
        "mapget" => {
            let i = Instruction::MapGet {
                key: refs!(0),
                map: loc!(1),
            };
            consumed += 2;
            i
        }
        "maplength" => {
            let i = Instruction::MapLength { map: loc!(0) };
            consumed += 1;
            i
        }
        "mapkeys" => {
            let i = Instruction::MapKeys { map: loc!(0) };
            consumed += 1;
            i
        }
        "enuminit" => {
            let i = Instruction::EnumInit {
                value_type: refs!(0),
            };
            consumed += 1;
            i
        }
        "enumappend" => {
            let i = Instruction::EnumAppend {
                value: refs!(0),
                enumeration: loc!(1),
            };
            consumed += 2;
            i
        }
        "enumprepend" => {
            let i = Instruction::EnumPrepend {
                value: refs!(0),
                enumeration: loc!(1),
            };
            consumed += 2;
            i
        }
        "enumlength" => {
            let i = Instruction::EnumLength {
                enumeration: loc!(0),
            };
            consumed += 1;
            i
        }
        "enumget" => {
            let i = Instruction::EnumGet {
                enumeration: loc!(0),
                index: refs!(1),
            };
            consumed += 2;
            i
        }
        "enumset" => {
            let i = Instruction::EnumSet {
                enumeration: loc!(0),
                index: refs!(1),
                value: refs!(2),
            };
            consumed += 3;
            i
        }
        "enumconcat" => {
            let i = Instruction::EnumConcat {
                lhs: loc!(0),
                rhs: loc!(1),
            };
            consumed += 2;
            i
        }
        "enumerate" => {
            let i = Instruction::Enumerate {
                value_type: refs!(0),
                enumeration: loc!(1),
                callback: loc!(2),
            };
            consumed += 3;
            i
        }
        "strconcat" => {
            let i = Instruction::StrConcat {
                lhs: refs!(0),
                rhs: refs!(1),
            };
            consumed += 2;
            i
        }
        "strlength" => {
            let i = Instruction::StrLength { value: refs!(0) };
            consumed += 1;
            i
        }
        "strslice" => {
            if count_operands(tokens, args) < 3 {
                let i = Instruction::StrSliceFrom {
                    value: refs!(0),
                    from: refs!(1),
                };
                consumed += 2;
                i
            } else {
                let i = Instruction::StrSliceFromTo {
                    value: refs!(0),
                    from: refs!(1),
                    to: refs!(2),
                };
                consumed += 3;
                i
            }
        }
        "plus" | "minus" | "times" | "divide" | "power" | "mod" | "gt" | "gte" | "lt" | "lte" => {
            let lhs = refs!(0);
            let rhs = refs!(1);
            consumed += 2;
            match mnemonic {
                "plus" => Instruction::Plus { lhs, rhs },
                "minus" => Instruction::Minus { lhs, rhs },
                "times" => Instruction::Times { lhs, rhs },
                "divide" => Instruction::Divide { lhs, rhs },
                "power" => Instruction::Power { lhs, rhs },
                "mod" => Instruction::Mod { lhs, rhs },
                "gt" => Instruction::Gt { lhs, rhs },
                "gte" => Instruction::Gte { lhs, rhs },
                "lt" => Instruction::Lt { lhs, rhs },
                _ => Instruction::Lte { lhs, rhs },
            }
        }
        "neg" => {
            let i = Instruction::Neg { value: refs!(0) };
            consumed += 1;
            i
        }
        "while" => {
            let i = Instruction::While {
                condition: refs!(0),
                callback: loc!(1),
            };
            consumed += 2;
            i
        }
        "with" => {
            let i = Instruction::With {
                resource: refs!(0),
                callback: loc!(1),
            };
            consumed += 2;
            i
        }
        "pushexhandler" => {
            if count_operands(tokens, args) < 2 {
                let i = Instruction::PushExHandler1 { handler: loc!(0) };
                consumed += 1;
                i
            } else {
                let i = Instruction::PushExHandler2 {
                    handler: loc!(0),
                    discriminator: loc!(1),
                };
                consumed += 2;
                i
            }
        }
        "popexhandler" => {
            let i = Instruction::PopExHandler {
                handler_id: refs!(0),
            };
            consumed += 1;
            i
        }
        "raise" => {
            let i = Instruction::Raise { code: refs!(0) };
            consumed += 1;
            i
        }
        "resume" => {
            let i = Instruction::Resume { function: loc!(0) };
            consumed += 1;
            i
        }
        "otypeinit" => Instruction::OTypeInit,
        "otypeprop" => {
            let i = Instruction::OTypeProp {
                otype: refs!(0),
                property: prop!(1),
                prop_type: refs!(2),
            };
            consumed += 3;
            i
        }
        "otypedel" => {
            let i = Instruction::OTypeDel {
                otype: refs!(0),
                property: prop!(1),
            };
            consumed += 2;
            i
        }
        "otypeget" => {
            let i = Instruction::OTypeGet {
                otype: refs!(0),
                property: prop!(1),
            };
            consumed += 2;
            i
        }
        "otypefinalize" => {
            let i = Instruction::OTypeFinalize { otype: refs!(0) };
            consumed += 1;
            i
        }
        "otypesubset" => {
            let i = Instruction::OTypeSubset { otype: refs!(0) };
            consumed += 1;
            i
        }
        "objinit" => {
            let i = Instruction::ObjInit { otype: refs!(0) };
            consumed += 1;
            i
        }
        "objset" => {
            let i = Instruction::ObjSet {
                object: refs!(0),
                property: prop!(1),
                value: refs!(2),
            };
            consumed += 3;
            i
        }
        "objget" => {
            let i = Instruction::ObjGet {
                object: refs!(0),
                property: prop!(1),
            };
            consumed += 2;
            i
        }
        "objinstance" => {
            let i = Instruction::ObjInstance { object: refs!(0) };
            consumed += 1;
            i
        }
        "objcurry" => {
            let i = Instruction::ObjCurry {
                object: refs!(0),
                property: prop!(1),
            };
            consumed += 2;
            i
        }
        unknown => {
            return Err(SviError::malformed(format!(
                "`{unknown}` (unknown instruction tag)"
            )))
        }
    };

    is.push(instruction);
    Ok(consumed)
}

fn expect_number(reference: Reference, context: &str) -> SviResult<f64> {
    match reference {
        Reference::Number(n) => Ok(n),
        other => Err(SviError::malformed(format!(
            "malformed {context} (expected number, got {other})"
        ))),
    }
}

/// Parse `$loc <- rhs`, producing either an `assignvalue` (reference RHS)
/// or an `assigneval` (instruction RHS).
fn parse_assignment(is: &mut Instructions, tokens: &[String], at: usize) -> SviResult<usize> {
    let lval_token = &tokens[at];
    let dest = match parse_reference(lval_token)? {
        Reference::Location(loc) => loc,
        _ => {
            return Err(SviError::malformed(format!(
                "malformed assignment (expected location lval, got `{lval_token}`)"
            )))
        }
    };

    let mut consumed = 1;
    let arrow = expect(tokens, at + consumed, lval_token)?;
    if arrow != "<-" {
        return Err(SviError::malformed(format!(
            "malformed assignment to `{lval_token}` (expected <-, got {arrow})"
        )));
    }
    consumed += 1;

    let rhs_leader = expect(tokens, at + consumed, lval_token)?;
    if is_reference_leader(rhs_leader) {
        let value = parse_reference(rhs_leader)?;
        consumed += 1;
        is.push(Instruction::AssignValue { dest, value });
    } else {
        let mut inner = Vec::new();
        consumed += parse_instruction(&mut inner, tokens, at + consumed)?;
        let eval = inner
            .pop()
            .ok_or_else(|| SviError::malformed("assignment RHS parsed to no instruction"))?;
        is.push(Instruction::AssignEval {
            dest,
            eval: Box::new(eval),
        });
    }

    Ok(consumed)
}

/// Parse the reference represented by a single token.
pub fn parse_reference(token: &str) -> SviResult<Reference> {
    if is_location_leader(token) {
        return Ok(Reference::Location(parse_location(token)?));
    }

    if is_type_leader(token) {
        return Ok(Reference::TypeRef(parse_type_name(token)?));
    }

    if let Some(stripped) = token.strip_prefix('"') {
        let content = stripped
            .strip_suffix('"')
            .ok_or_else(|| SviError::malformed(format!("malformed string reference `{token}`")))?;
        return Ok(Reference::StringVal(content.to_string()));
    }

    if token.starts_with(|c: char| c.is_ascii_digit()) {
        return token
            .parse::<f64>()
            .map(Reference::Number)
            .map_err(|_| SviError::malformed(format!("malformed number reference `{token}`")));
    }

    match token {
        "true" => Ok(Reference::Boolean(true)),
        "false" => Ok(Reference::Boolean(false)),
        _ => Err(SviError::malformed(format!(
            "malformed reference `{token}`"
        ))),
    }
}

/// Parse a location token of the form `$a:name`, `f:name`, `o:name`, or
/// `p:name`.
pub fn parse_location(token: &str) -> SviResult<LocationReference> {
    let bare = token.strip_prefix('$').unwrap_or(token);
    let (prefix, name) = bare.split_once(':').ok_or_else(|| {
        SviError::malformed(format!(
            "malformed location reference `{token}` (expected form a:name)"
        ))
    })?;

    let mut prefix_chars = prefix.chars();
    let affinity = match (prefix_chars.next(), prefix_chars.next()) {
        (Some(c), None) => Affinity::from_prefix(c),
        _ => None,
    }
    .ok_or_else(|| {
        SviError::malformed(format!(
            "invalid location affinity `{token}` (expected l, s, f, p, or o)"
        ))
    })?;

    if name.is_empty() {
        return Err(SviError::malformed(format!(
            "malformed location reference `{token}` (empty name)"
        )));
    }

    Ok(LocationReference::new(affinity, name))
}

/// Parse a primitive type name token (`p:NUMBER`, `p:THIS`, ...).
pub fn parse_type_name(token: &str) -> SviResult<Type> {
    match token {
        "p:TYPE" => Ok(Type::Type),
        "p:VOID" => Ok(Type::Void),
        "p:NUMBER" => Ok(Type::Number),
        "p:STRING" => Ok(Type::String),
        "p:BOOLEAN" => Ok(Type::Boolean),
        "p:THIS" => Ok(Type::This),
        _ => Err(SviError::malformed(format!(
            "malformed primitive type name `{token}` \
             (expected one of p:TYPE, p:NUMBER, p:STRING, p:BOOLEAN, p:VOID, p:THIS)"
        ))),
    }
}

fn is_location_leader(token: &str) -> bool {
    if token.starts_with('$') {
        return true;
    }
    // Parametric type constructors resolve through the primitive store.
    if matches!(token, "p:MAP" | "p:ENUM" | "p:LAMBDA0" | "p:LAMBDA") {
        return true;
    }
    let mut chars = token.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some('f') | Some('o'), Some(':'))
    )
}

fn is_type_leader(token: &str) -> bool {
    token.len() > 2
        && token.starts_with("p:")
        && !matches!(token, "p:MAP" | "p:ENUM" | "p:LAMBDA0" | "p:LAMBDA")
}

fn is_reference_leader(token: &str) -> bool {
    token.starts_with('"')
        || token.starts_with(|c: char| c.is_ascii_digit())
        || is_location_leader(token)
        || is_type_leader(token)
        || token == "true"
        || token == "false"
}

/// Count the reference operands ahead of the next opcode or assignment.
///
/// The lookahead has one wrinkle: in `call f:F` followed by `$l:a <- 3`,
/// the `$l:a` token is itself a valid operand, so the count is reduced by
/// one when the token after the run is the assignment arrow.
fn count_operands(tokens: &[String], at: usize) -> usize {
    let mut n = 0;
    for token in &tokens[at.min(tokens.len())..] {
        if is_reference_leader(token) {
            n += 1;
        } else {
            break;
        }
    }

    if let Some(next) = tokens.get(at + n) {
        if next == "<-" && n > 0 {
            n -= 1;
        }
    }

    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instructions::Tag;

    #[test]
    fn tokenizer_strips_comments_and_groups_strings() {
        let tokens = tokenize("out \"hi there\" -- trailing comment\nexit").unwrap();
        assert_eq!(tokens, vec!["out", "\"hi there\"", "exit"]);
    }

    #[test]
    fn tokenizer_keeps_arrow_tokens() {
        let tokens = tokenize("$l:a <- 2").unwrap();
        assert_eq!(tokens, vec!["$l:a", "<-", "2"]);
    }

    #[test]
    fn string_escapes_resolve() {
        let tokens = tokenize(r#"out "say \"hi\"\n""#).unwrap();
        assert_eq!(tokens[1], "\"say \"hi\"\n\"");
        let parsed = parse_reference(&tokens[1]).unwrap();
        assert_eq!(parsed, Reference::StringVal("say \"hi\"\n".into()));
    }

    #[test]
    fn assignment_with_reference_rhs() {
        let is = parse("$l:a <- 2").unwrap();
        assert_eq!(is.len(), 1);
        match &is[0] {
            Instruction::AssignValue { dest, value } => {
                assert_eq!(dest.fq_name(), "l:a");
                assert_eq!(*value, Reference::Number(2.0));
            }
            other => panic!("expected assignvalue, got {other}"),
        }
    }

    #[test]
    fn assignment_with_instruction_rhs() {
        let is = parse("$l:c <- plus $l:a $l:b").unwrap();
        match &is[0] {
            Instruction::AssignEval { dest, eval } => {
                assert_eq!(dest.name(), "c");
                assert_eq!(eval.tag(), Tag::Plus);
            }
            other => panic!("expected assigneval, got {other}"),
        }
    }

    #[test]
    fn polyadic_return_disambiguates() {
        let is = parse("return\nout \"after\"").unwrap();
        assert_eq!(is[0].tag(), Tag::Return0);

        let is = parse("return $l:r\nout \"after\"").unwrap();
        assert_eq!(is[0].tag(), Tag::Return1);
    }

    #[test]
    fn call_followed_by_assignment_keeps_lval() {
        let is = parse("call f:noop\n$l:a <- 3").unwrap();
        assert_eq!(is.len(), 2);
        assert_eq!(is[0].tag(), Tag::Call0);
        assert_eq!(is[1].tag(), Tag::AssignValue);
    }

    #[test]
    fn callif_arities() {
        let is = parse("callif $l:c f:say\nexit").unwrap();
        assert_eq!(is[0].tag(), Tag::CallIf0);

        let is = parse("callif $l:c f:say 5\nexit").unwrap();
        assert_eq!(is[0].tag(), Tag::CallIf1);
    }

    #[test]
    fn strslice_arities() {
        assert_eq!(
            parse("strslice \"abc\" 1\nexit").unwrap()[0].tag(),
            Tag::StrSliceFrom
        );
        assert_eq!(
            parse("strslice \"abc\" 1 2\nexit").unwrap()[0].tag(),
            Tag::StrSliceFromTo
        );
    }

    #[test]
    fn type_tokens_and_primitive_locations_differ() {
        // Bare `p:NUMBER` is a type literal; `$p:NUMBER` is a location in
        // the primitive store.
        let t = parse_reference("p:NUMBER").unwrap();
        assert_eq!(t, Reference::TypeRef(Type::Number));

        match parse_reference("$p:NUMBER").unwrap() {
            Reference::Location(loc) => assert_eq!(loc.affinity(), Affinity::Primitive),
            other => panic!("expected location, got {other}"),
        }
    }

    #[test]
    fn scenario_programs_parse() {
        let arith = "
            $l:a <- 2
            $l:b <- 3
            $l:c <- plus $l:a $l:b
            out $l:c
        ";
        assert_eq!(parse(arith).unwrap().len(), 4);

        let cond = "
            $l:cond <- true
            beginfn f:say $p:VOID
              out \"hi\"
              return
            callif $l:cond f:say
        ";
        let is = parse(cond).unwrap();
        assert_eq!(is.len(), 5);
        assert_eq!(is[1].tag(), Tag::BeginFn);
        assert_eq!(is[3].tag(), Tag::Return0);
        assert_eq!(is[4].tag(), Tag::CallIf0);

        let maps = "
            $l:m <- mapinit $p:NUMBER
            mapset \"x\" 7 $l:m
            $l:v <- mapget \"x\" $l:m
            out $l:v
        ";
        assert_eq!(parse(maps).unwrap().len(), 4);
    }

    #[test]
    fn position_annotation_parses() {
        let is = parse(".position \"main.sw\" 3 7\nout 1").unwrap();
        match &is[0] {
            Instruction::Position(p) => {
                assert_eq!(p.file, "main.sw");
                assert_eq!(p.line, 3);
                assert_eq!(p.col, 7);
            }
            other => panic!("expected position, got {other}"),
        }
    }

    #[test]
    fn unknown_mnemonic_is_rejected() {
        assert!(parse("frobnicate 1 2").is_err());
        assert!(parse("$l:a <-").is_err());
        assert!(parse("$l:a < 2").is_err());
    }
}
