//! Command line splitting and the argument block a process starts with.
//!
//! ```text
//! args_start
//! +-----------+-----------+-----+------+-----------+-----------+-----+
//! | argv[0]   | argv[1]   | ... | NULL | "prog\0"  | "arg1\0"  | ... |
//! +-----------+-----------+-----+------+-----------+-----------+-----+
//!   u64 user pointers into the string area
//! ```

use alloc::string::String;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;

/// Split a command line at whitespace. Single or double quotes group text
/// containing whitespace and are removed; an unterminated quote runs to the
/// end of the line.
#[must_use]
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(core::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Lay out `tokens` as an `argv` block to be mapped at `base`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn build_argument_block(tokens: &[String], base: VirtualAddress) -> Vec<u8> {
    let table = (tokens.len() as u64 + 1) * 8;
    let strings: usize = tokens.iter().map(|t| t.len() + 1).sum();
    let mut block = Vec::with_capacity(table as usize + strings);

    let mut string_at = base.as_u64() + table;
    for token in tokens {
        block.extend_from_slice(&string_at.to_le_bytes());
        string_at += token.len() as u64 + 1;
    }
    block.extend_from_slice(&0u64.to_le_bytes());
    for token in tokens {
        block.extend_from_slice(token.as_bytes());
        block.push(0);
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(split_command_line("  init  -v\tfoo "), ["init", "-v", "foo"]);
        assert!(split_command_line("   ").is_empty());
    }

    #[test]
    fn quotes_group_words() {
        assert_eq!(
            split_command_line(r#"echo "hello world" 'it"s' a"b c"d"#),
            ["echo", "hello world", "it\"s", "ab cd"]
        );
        assert_eq!(split_command_line("run ''"), ["run", ""]);
        assert_eq!(split_command_line("open 'no end"), ["open", "no end"]);
    }

    #[test]
    fn block_points_into_itself() {
        let tokens = split_command_line("sh -c");
        let base = VirtualAddress::new(0x40_1000);
        let block = build_argument_block(&tokens, base);

        let word = |i: usize| u64::from_le_bytes(block[i * 8..i * 8 + 8].try_into().unwrap());
        assert_eq!(word(0), 0x40_1000 + 24);
        assert_eq!(word(1), 0x40_1000 + 27);
        assert_eq!(word(2), 0);
        assert_eq!(&block[24..], b"sh\0-c\0");
    }
}
