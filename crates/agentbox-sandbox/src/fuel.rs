//! Fuel accounting
//!
//! Fuel is the instruction budget of a sandboxed call. Every construct falls
//! into one [`InstructionCategory`] and costs that category's weight; the
//! total is compared against the tier's fuel limit.
//!
//! Script fuel is estimated from source text before anything runs; the
//! [`FuelMeter`] is the budget authority for scripts. Wasm modules report
//! the fuel wasmtime actually burned through [`FuelMeteringResult::from_consumed`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Iterations assumed for a loop whose bound is not a literal
pub const DEFAULT_LOOP_ITERATIONS: u64 = 100;

/// Ceiling on a single literal loop bound used by the estimator
const MAX_LOOP_ITERATIONS: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionCategory {
    Arithmetic,
    Control,
    Function,
    Other,
}

impl InstructionCategory {
    pub const ALL: [InstructionCategory; 4] = [
        Self::Arithmetic,
        Self::Control,
        Self::Function,
        Self::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arithmetic => "arithmetic",
            Self::Control => "control",
            Self::Function => "function",
            Self::Other => "other",
        }
    }
}

/// Per-category fuel cost. Control flow always costs more than arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuelWeights {
    pub arithmetic: u64,
    pub control: u64,
    pub function: u64,
    pub other: u64,
}

impl Default for FuelWeights {
    fn default() -> Self {
        Self {
            arithmetic: 1,
            control: 3,
            function: 5,
            other: 1,
        }
    }
}

impl FuelWeights {
    pub fn weight(&self, category: InstructionCategory) -> u64 {
        match category {
            InstructionCategory::Arithmetic => self.arithmetic,
            InstructionCategory::Control => self.control,
            InstructionCategory::Function => self.function,
            InstructionCategory::Other => self.other,
        }
    }
}

/// Instruction counts per category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstructionCounts {
    pub arithmetic: u64,
    pub control: u64,
    pub function: u64,
    pub other: u64,
}

impl InstructionCounts {
    pub fn get(&self, category: InstructionCategory) -> u64 {
        match category {
            InstructionCategory::Arithmetic => self.arithmetic,
            InstructionCategory::Control => self.control,
            InstructionCategory::Function => self.function,
            InstructionCategory::Other => self.other,
        }
    }

    pub fn add(&mut self, category: InstructionCategory, n: u64) {
        let slot = match category {
            InstructionCategory::Arithmetic => &mut self.arithmetic,
            InstructionCategory::Control => &mut self.control,
            InstructionCategory::Function => &mut self.function,
            InstructionCategory::Other => &mut self.other,
        };
        *slot = slot.saturating_add(n);
    }

    pub fn total(&self) -> u64 {
        InstructionCategory::ALL
            .iter()
            .fold(0u64, |acc, c| acc.saturating_add(self.get(*c)))
    }

    pub fn fuel(&self, weights: &FuelWeights) -> u64 {
        InstructionCategory::ALL.iter().fold(0u64, |acc, c| {
            acc.saturating_add(self.get(*c).saturating_mul(weights.weight(*c)))
        })
    }
}

/// Fuel report attached to metered executions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuelMeteringResult {
    pub instructions_executed: u64,
    pub fuel_consumed: u64,
    pub fuel_remaining: u64,
    pub fuel_limit_exceeded: bool,
    pub instruction_breakdown: BTreeMap<String, u64>,
}

impl FuelMeteringResult {
    /// Build a report from category counts. With metering disabled the
    /// counts are still reported but the limit is never exceeded.
    pub fn from_counts(counts: &InstructionCounts, weights: &FuelWeights, fuel_limit: u64, enabled: bool) -> Self {
        let fuel_consumed = counts.fuel(weights);
        let instruction_breakdown = InstructionCategory::ALL
            .iter()
            .map(|c| (c.as_str().to_string(), counts.get(*c)))
            .collect();
        Self {
            instructions_executed: counts.total(),
            fuel_consumed,
            fuel_remaining: fuel_limit.saturating_sub(fuel_consumed),
            fuel_limit_exceeded: enabled && fuel_consumed > fuel_limit,
            instruction_breakdown,
        }
    }

    /// Report for engines that only expose a fuel total (wasm)
    pub fn from_consumed(fuel_consumed: u64, fuel_limit: u64, enabled: bool) -> Self {
        let counts = InstructionCounts {
            other: fuel_consumed,
            ..Default::default()
        };
        let weights = FuelWeights {
            other: 1,
            ..FuelWeights::default()
        };
        Self::from_counts(&counts, &weights, fuel_limit, enabled)
    }

    /// Message used when a call is rejected for exceeding its budget
    pub fn exceeded_message(&self, fuel_limit: u64) -> String {
        format!(
            "Fuel limit exceeded: consumed {} fuel, limit {}",
            self.fuel_consumed, fuel_limit
        )
    }
}

/// Lexical unit seen by the estimator. Strings, templates and comments
/// collapse so their contents never count as code.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Token<'a> {
    Word(&'a str),
    Number(f64),
    Literal,
    Punct(&'static str),
}

/// Longest first so `===` wins over `==` and `=`
const PUNCTUATORS: &[&str] = &[
    ">>>=", "===", "!==", "**=", "...", ">>>", "<<=", ">>=", "&&=", "||=", "??=", "=>", "==", "!=", "<=", ">=",
    "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "**", "<<", ">>", "&=", "|=", "^=", "{",
    "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-", "*", "/", "%", "&", "|", "^", "!", "~", "?", ":",
    "=", ".", "@", "#",
];

fn is_word_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphabetic()
}

fn is_word_part(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphanumeric()
}

/// Byte length of the quoted run at the start of `rest`, quotes included.
/// Plain strings also stop at a line break.
fn quoted_len(rest: &str, quote: char) -> usize {
    let mut escaped = false;
    for (i, c) in rest.char_indices().skip(1) {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return i + 1;
        } else if c == '\n' && quote != '`' {
            return i;
        }
    }
    rest.len()
}

fn parse_number(text: &str) -> f64 {
    let digits: String = text.chars().filter(|c| *c != '_').collect();
    let lower = digits.to_ascii_lowercase();
    let radix = match lower.get(..2) {
        Some("0x") => Some(16),
        Some("0o") => Some(8),
        Some("0b") => Some(2),
        _ => None,
    };
    match radix {
        Some(radix) => u64::from_str_radix(&lower[2..], radix).map(|n| n as f64).unwrap_or(f64::NAN),
        None => lower.trim_end_matches('n').parse().unwrap_or(f64::NAN),
    }
}

/// Split source into estimator tokens. Never fails; malformed input just
/// yields whatever tokens can be recognised.
fn tokenize(code: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < code.len() {
        let rest = &code[i..];
        let Some(c) = rest.chars().next() else { break };

        if c.is_whitespace() {
            i += c.len_utf8();
        } else if rest.starts_with("//") {
            i += rest.find('\n').unwrap_or(rest.len());
        } else if rest.starts_with("/*") {
            i += rest[2..].find("*/").map(|end| end + 4).unwrap_or(rest.len());
        } else if matches!(c, '"' | '\'' | '`') {
            i += quoted_len(rest, c);
            tokens.push(Token::Literal);
        } else if c.is_ascii_digit() || (c == '.' && rest[1..].starts_with(|d: char| d.is_ascii_digit())) {
            let len = rest
                .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '.' || ch == '_'))
                .unwrap_or(rest.len());
            tokens.push(Token::Number(parse_number(&rest[..len])));
            i += len;
        } else if is_word_start(c) {
            let len = rest.find(|ch: char| !is_word_part(ch)).unwrap_or(rest.len());
            tokens.push(Token::Word(&rest[..len]));
            i += len;
        } else if let Some(p) = PUNCTUATORS.iter().find(|p| rest.starts_with(**p)) {
            tokens.push(Token::Punct(*p));
            i += p.len();
        } else {
            i += c.len_utf8();
        }
    }
    tokens
}

/// Static cost estimation of a code unit
pub trait FuelEstimator: Send + Sync {
    fn count(&self, code: &str) -> InstructionCounts;
}

/// Token-based estimator with loop multipliers.
///
/// Loop bodies are multiplied by the literal bound of a `< N` / `<= N`
/// comparison in the loop header, or [`DEFAULT_LOOP_ITERATIONS`] otherwise.
/// Nested loops multiply.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

/// Words that take a parenthesised clause without being calls
fn is_keyword(word: &str) -> bool {
    matches!(
        word,
        "catch" | "with" | "new" | "await" | "yield" | "delete" | "void" | "in" | "of" | "instanceof" | "super"
    )
}

enum LoopPhase {
    /// Inside the `( ... )` header; closes when paren depth returns to this value
    Header { paren_depth: usize },
    /// Braced body; closes when brace depth returns to this value
    Block { brace_depth: usize },
    /// Single-statement body; closes at the next `;` on this brace depth
    Statement { brace_depth: usize },
}

struct LoopFrame {
    iterations: u64,
    phase: LoopPhase,
}

impl HeuristicEstimator {
    fn classify(token: &Token<'_>, next: Option<&Token<'_>>) -> Option<InstructionCategory> {
        use InstructionCategory::*;
        let category = match token {
            Token::Punct(p) => match *p {
                "+" | "-" | "*" | "/" | "%" | "**" | "++" | "--" | "+=" | "-=" | "*=" | "/=" | "%=" | "**="
                | "<" | ">" | "<=" | ">=" | "==" | "!=" | "===" | "!==" | "!" => Arithmetic,
                "?" | "&&" | "||" | "??" => Control,
                "=>" => Function,
                "=" | "." | "[" => Other,
                _ => return None,
            },
            Token::Word(word) => match *word {
                "if" | "else" | "for" | "while" | "do" | "switch" | "case" | "break" | "continue" | "throw"
                | "try" => Control,
                "function" | "return" => Function,
                "typeof" => Arithmetic,
                _ if matches!(next, Some(Token::Punct("("))) && !is_keyword(word) => Function,
                _ => Other,
            },
            Token::Number(_) | Token::Literal => Other,
        };
        Some(category)
    }

    /// Literal bound of a loop header starting at `start` (the `(`)
    fn header_bound(tokens: &[Token<'_>], start: usize) -> u64 {
        let mut depth = 0usize;
        for i in start..tokens.len() {
            match &tokens[i] {
                Token::Punct("(") => depth += 1,
                Token::Punct(")") => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        break;
                    }
                }
                Token::Punct("<") | Token::Punct("<=") => {
                    if let Some(Token::Number(n)) = tokens.get(i + 1) {
                        if n.is_finite() && *n >= 0.0 {
                            return (*n as u64).min(MAX_LOOP_ITERATIONS);
                        }
                    }
                }
                _ => {}
            }
        }
        DEFAULT_LOOP_ITERATIONS
    }
}

impl FuelEstimator for HeuristicEstimator {
    fn count(&self, code: &str) -> InstructionCounts {
        let mut counts = InstructionCounts::default();
        let tokens = tokenize(code);

        let mut frames: Vec<LoopFrame> = Vec::new();
        let mut braces = 0usize;
        let mut parens = 0usize;

        for i in 0..tokens.len() {
            let token = &tokens[i];
            let multiplier = frames
                .iter()
                .fold(1u64, |acc, f| acc.saturating_mul(f.iterations.max(1)));

            let opens_loop = matches!(token, Token::Word("for") | Token::Word("while"));
            if opens_loop && matches!(tokens.get(i + 1), Some(Token::Punct("("))) {
                let iterations = Self::header_bound(&tokens, i + 1);
                // one control charge per iteration
                counts.add(
                    InstructionCategory::Control,
                    multiplier.saturating_mul(iterations.max(1)),
                );
                frames.push(LoopFrame {
                    iterations,
                    phase: LoopPhase::Header { paren_depth: parens },
                });
                continue;
            }
            if matches!(token, Token::Word("do")) && matches!(tokens.get(i + 1), Some(Token::Punct("{"))) {
                counts.add(
                    InstructionCategory::Control,
                    multiplier.saturating_mul(DEFAULT_LOOP_ITERATIONS),
                );
                frames.push(LoopFrame {
                    iterations: DEFAULT_LOOP_ITERATIONS,
                    phase: LoopPhase::Block { brace_depth: braces },
                });
                continue;
            }

            if let Some(category) = Self::classify(token, tokens.get(i + 1)) {
                counts.add(category, multiplier);
            }

            match token {
                Token::Punct("(") => parens += 1,
                Token::Punct(")") => {
                    parens = parens.saturating_sub(1);
                    if let Some(frame) = frames.last_mut() {
                        if let LoopPhase::Header { paren_depth } = frame.phase {
                            if parens == paren_depth {
                                frame.phase = if matches!(tokens.get(i + 1), Some(Token::Punct("{"))) {
                                    LoopPhase::Block { brace_depth: braces }
                                } else {
                                    LoopPhase::Statement { brace_depth: braces }
                                };
                            }
                        }
                    }
                }
                Token::Punct("{") => braces += 1,
                Token::Punct("}") => {
                    braces = braces.saturating_sub(1);
                    while let Some(frame) = frames.last() {
                        match frame.phase {
                            LoopPhase::Block { brace_depth } if braces == brace_depth => {
                                frames.pop();
                            }
                            LoopPhase::Statement { brace_depth } if braces < brace_depth => {
                                frames.pop();
                            }
                            _ => break,
                        }
                    }
                }
                Token::Punct(";") => {
                    while let Some(frame) = frames.last() {
                        match frame.phase {
                            LoopPhase::Statement { brace_depth } if braces == brace_depth => {
                                frames.pop();
                            }
                            _ => break,
                        }
                    }
                }
                _ => {}
            }
        }
        counts
    }
}

/// Pre-flight estimator combining an estimation strategy with the weights
pub struct FuelMeter {
    weights: FuelWeights,
    estimator: Box<dyn FuelEstimator>,
}

impl FuelMeter {
    pub fn new() -> Self {
        Self::with_estimator(HeuristicEstimator)
    }

    pub fn with_estimator(estimator: impl FuelEstimator + 'static) -> Self {
        Self {
            weights: FuelWeights::default(),
            estimator: Box::new(estimator),
        }
    }

    pub fn weights(&self) -> FuelWeights {
        self.weights
    }

    pub fn estimate(&self, code: &str, fuel_limit: u64, enabled: bool) -> FuelMeteringResult {
        let counts = self.estimator.count(code);
        FuelMeteringResult::from_counts(&counts, &self.weights, fuel_limit, enabled)
    }
}

impl Default for FuelMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FuelMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuelMeter").field("weights", &self.weights).finish()
    }
}
