use super::descriptor::{Anchor, InjectDeclaration, Position};
use super::Error;
use crate::jvm::code::{disassemble, Insn};
use crate::jvm::MethodNode;

/// Where injected code lands in a target method
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InjectionPoint {
    /// Insert before the instruction at this index (or at the end, if it equals the length)
    Insert(usize),

    /// Replace the inclusive range `[start, end]`
    Replace(usize, usize),
}

/// One line of an anchor pattern
#[derive(Debug)]
enum PatternLine<'a> {
    /// `*` on its own
    Any,
    Tokens(Vec<&'a str>),
}

impl<'a> PatternLine<'a> {
    fn matches(&self, line: &str) -> bool {
        let tokens = match self {
            PatternLine::Any => return true,
            PatternLine::Tokens(tokens) => tokens,
        };
        let mut actual = line.split_whitespace();
        for expected in tokens {
            let found = match actual.next() {
                Some(found) => found,
                None => return false,
            };
            let ok = match *expected {
                "*" => true,
                "L*" => is_label(found),
                _ => *expected == found,
            };
            if !ok {
                return false;
            }
        }
        actual.next().is_none()
    }
}

fn is_label(token: &str) -> bool {
    token.len() > 1
        && token.starts_with('L')
        && token[1..].bytes().all(|b| b.is_ascii_digit())
}

fn parse_pattern(pattern: &str) -> Vec<PatternLine<'_>> {
    pattern
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line {
            "*" => PatternLine::Any,
            _ => PatternLine::Tokens(line.split_whitespace().collect()),
        })
        .collect()
}

/// Find the first run of instructions matching a pattern
///
/// Returns the indices of the first and last matched instruction. A mismatch drops the partial
/// match and retries the same instruction as the start of a new one; there is no backtracking
/// into instructions the partial match already consumed.
pub fn find_pattern(
    insns: &[Insn],
    pattern: &str,
    ignore_line_numbers: bool,
) -> Option<(usize, usize)> {
    let lines = parse_pattern(pattern);
    if lines.is_empty() {
        return None;
    }

    let mut matched = 0;
    let mut start = 0;
    for (idx, insn) in insns.iter().enumerate() {
        if ignore_line_numbers && matches!(insn, Insn::LineNumber { .. }) {
            continue;
        }
        let text = insn.to_string();

        if !lines[matched].matches(&text) {
            // The mismatching instruction is not tried as a new start
            matched = 0;
            continue;
        }
        if matched == 0 {
            start = idx;
        }
        matched += 1;
        if matched == lines.len() {
            return Some((start, idx));
        }
    }
    None
}

/// Resolve an injection declaration to a point in the target method
pub fn locate(method: &MethodNode, declaration: &InjectDeclaration) -> Result<InjectionPoint, Error> {
    let len = method.instructions.len();
    let offset = declaration.offset as i64;
    let method_name = format!("{}{}", method.name, method.descriptor);

    let check = |index: i64, limit: usize| -> Result<usize, Error> {
        if index < 0 || index as usize > limit {
            Err(Error::InvalidInjectionPoint {
                method: method_name.clone(),
                index,
                len,
            })
        } else {
            Ok(index as usize)
        }
    };

    let range = match &declaration.anchor {
        Anchor::Head | Anchor::Tail if declaration.position == Position::Replace => {
            return Err(Error::InvalidPatch(format!(
                "{}: only a pattern anchor can be replaced",
                method_name
            )))
        }
        Anchor::Head => return check(offset, len).map(InjectionPoint::Insert),
        Anchor::Tail => return check(len as i64 + offset, len).map(InjectionPoint::Insert),
        Anchor::Pattern(pattern) => {
            find_pattern(&method.instructions, pattern, declaration.ignore_line_numbers)
                .ok_or_else(|| Error::AnchorNotFound {
                    method: method_name.clone(),
                    pattern: pattern.clone(),
                    disassembly: disassemble(&method.instructions),
                })?
        }
    };

    let (start, end) = (range.0 as i64, range.1 as i64);
    match declaration.position {
        Position::Before => check(start + offset, len).map(InjectionPoint::Insert),
        Position::After => check(end + 1 + offset, len).map(InjectionPoint::Insert),
        Position::Replace => {
            let last = len.saturating_sub(1);
            let start = check(start + offset, last)?;
            let end = check(end + offset, last)?;
            Ok(InjectionPoint::Replace(start, end))
        }
    }
}
