//! Line parsing: quote-aware tokenization and statement assembly.
//!
//! The tokenizer is a small state machine over the input characters; words
//! keep their quoting context as segments so the expander can decide what
//! to expand where. Statement assembly groups `function … end` and
//! `begin … end` constructs by tracking nesting across statements.

/// One quoted or unquoted run of characters inside a word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WordSegment {
    Unquoted(String),
    SingleQuoted(String),
    DoubleQuoted(String),
}

/// A word is a sequence of segments with mixed quoting (e.g. `he"ll"o`).
pub type Word = Vec<WordSegment>;

/// Flatten a word to plain text, ignoring quoting. Used for keyword
/// recognition and display.
pub fn word_text(word: &Word) -> String {
    word.iter()
        .map(|seg| match seg {
            WordSegment::Unquoted(s)
            | WordSegment::SingleQuoted(s)
            | WordSegment::DoubleQuoted(s) => s.as_str(),
        })
        .collect()
}

/// Whether a word is the bare unquoted keyword `kw` (quoting defeats
/// keyword recognition, as usual).
pub fn is_keyword(word: &Word, kw: &str) -> bool {
    matches!(word.as_slice(), [WordSegment::Unquoted(s)] if s == kw)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(Word),
    Pipe,
}

/// Consume input up to and including the parenthesis matching an already
/// consumed `(`, appending everything to `out`. Quotes are tracked only so
/// that parentheses inside them do not count.
fn capture_parenthesised(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    out: &mut String,
) -> Result<(), String> {
    let mut depth = 1;
    let mut quote: Option<char> = None;
    for ch in chars.by_ref() {
        out.push(ch);
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            },
        }
    }
    Err("unbalanced parenthesis".to_string())
}

/// States for the tokenizer state machine.
enum State {
    /// Between tokens — whitespace is skipped
    Normal,
    /// Building an unquoted word — whitespace ends it
    InWord,
    /// Inside double quotes — whitespace is preserved
    InDoubleQuote,
    /// Inside single quotes — everything is literal
    InSingleQuote,
}

/// Tokenize one statement (no `;`, `&`, or newlines) into words and pipes.
///
/// Handles:
/// - Unquoted words split by whitespace
/// - Double-quoted strings ("hello world" → one segment)
/// - Single-quoted strings ('hello world' → one segment)
/// - Backslash escapes (hello\ world → one word)
/// - `|` as a pipeline operator
/// - `#` starting a comment when it starts a word
pub fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut word: Word = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut chars = input.chars().peekable();

    fn flush_segment(word: &mut Word, current: &mut String, quote: Option<char>) {
        if current.is_empty() && quote.is_none() {
            return;
        }
        let text = std::mem::take(current);
        word.push(match quote {
            Some('\'') => WordSegment::SingleQuoted(text),
            Some('"') => WordSegment::DoubleQuoted(text),
            _ => WordSegment::Unquoted(text),
        });
    }

    fn flush_word(tokens: &mut Vec<Token>, word: &mut Word) {
        if !word.is_empty() {
            tokens.push(Token::Word(std::mem::take(word)));
        }
    }

    while let Some(ch) = chars.next() {
        // A command substitution is captured raw, quotes and all; the
        // expander re-parses the inner text when it runs it.
        if matches!(state, State::Normal | State::InWord) && ch == '(' {
            current.push('(');
            capture_parenthesised(&mut chars, &mut current)?;
            state = State::InWord;
            continue;
        }
        match (&state, ch) {
            // ── Normal state: between tokens ──
            (State::Normal, ' ' | '\t') => {}
            (State::Normal, '#') => break,
            (State::Normal, '|') => tokens.push(Token::Pipe),
            (State::Normal, '"') => state = State::InDoubleQuote,
            (State::Normal, '\'') => state = State::InSingleQuote,
            (State::Normal, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                state = State::InWord;
            }
            (State::Normal, c) => {
                current.push(c);
                state = State::InWord;
            }

            // ── InWord state: building an unquoted token ──
            (State::InWord, ' ' | '\t') => {
                flush_segment(&mut word, &mut current, None);
                flush_word(&mut tokens, &mut word);
                state = State::Normal;
            }
            (State::InWord, '|') => {
                flush_segment(&mut word, &mut current, None);
                flush_word(&mut tokens, &mut word);
                tokens.push(Token::Pipe);
                state = State::Normal;
            }
            (State::InWord, '"') => {
                flush_segment(&mut word, &mut current, None);
                state = State::InDoubleQuote;
            }
            (State::InWord, '\'') => {
                flush_segment(&mut word, &mut current, None);
                state = State::InSingleQuote;
            }
            (State::InWord, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (State::InWord, c) => current.push(c),

            // ── InDoubleQuote state: inside "..." ──
            (State::InDoubleQuote, '"') => {
                flush_segment(&mut word, &mut current, Some('"'));
                state = State::InWord;
            }
            (State::InDoubleQuote, '\\') => {
                // Inside double quotes, backslash only escapes: \ " $
                match chars.peek() {
                    Some(&'"' | &'\\' | &'$') => {
                        current.push(chars.next().unwrap());
                    }
                    _ => current.push('\\'),
                }
            }
            (State::InDoubleQuote, c) => current.push(c),

            // ── InSingleQuote state: inside '...' ──
            (State::InSingleQuote, '\'') => {
                flush_segment(&mut word, &mut current, Some('\''));
                state = State::InWord;
            }
            (State::InSingleQuote, c) => current.push(c),
        }
    }

    match state {
        State::InDoubleQuote => return Err("unterminated double quote".to_string()),
        State::InSingleQuote => return Err("unterminated single quote".to_string()),
        State::InWord => {
            flush_segment(&mut word, &mut current, None);
            flush_word(&mut tokens, &mut word);
        }
        State::Normal => flush_word(&mut tokens, &mut word),
    }

    Ok(tokens)
}

/// One raw statement and its terminator (`;`, `&`, or `\n`).
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawStatement {
    text: String,
    terminator: char,
}

/// Split source into raw statements at `;`, `&` and newlines, respecting
/// quotes, escapes and comments.
fn split_statements(source: &str) -> Result<Vec<RawStatement>, String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut chars = source.chars().peekable();

    let mut push = |current: &mut String, terminator: char| {
        let text = std::mem::take(current);
        let text = text.trim().to_string();
        if !text.is_empty() {
            out.push(RawStatement { text, terminator });
        }
    };

    while let Some(ch) = chars.next() {
        if matches!(state, State::Normal | State::InWord) && ch == '(' {
            current.push('(');
            capture_parenthesised(&mut chars, &mut current)?;
            continue;
        }
        match (&state, ch) {
            (State::InSingleQuote, '\'') => {
                state = State::Normal;
                current.push(ch);
            }
            (State::InSingleQuote, _) => current.push(ch),
            (State::InDoubleQuote, '"') => {
                state = State::Normal;
                current.push(ch);
            }
            (State::InDoubleQuote, '\\') => {
                current.push(ch);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (State::InDoubleQuote, _) => current.push(ch),
            (State::Normal | State::InWord, '\'') => {
                state = State::InSingleQuote;
                current.push(ch);
            }
            (State::Normal | State::InWord, '"') => {
                state = State::InDoubleQuote;
                current.push(ch);
            }
            (State::Normal | State::InWord, '\\') => {
                current.push(ch);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (State::Normal | State::InWord, '#')
                if current.is_empty() || current.ends_with(char::is_whitespace) =>
            {
                // Comment runs to end of line.
                for next in chars.by_ref() {
                    if next == '\n' {
                        push(&mut current, '\n');
                        break;
                    }
                }
            }
            (State::Normal | State::InWord, ';') => push(&mut current, ';'),
            (State::Normal | State::InWord, '&') => push(&mut current, '&'),
            (State::Normal | State::InWord, '\n') => push(&mut current, '\n'),
            (State::Normal | State::InWord, _) => current.push(ch),
        }
    }

    match state {
        State::InDoubleQuote => return Err("unterminated double quote".to_string()),
        State::InSingleQuote => return Err("unterminated single quote".to_string()),
        _ => push(&mut current, '\n'),
    }

    Ok(out)
}

/// One pipeline segment: either a simple command or a block evaluated
/// recursively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Simple(Vec<Word>),
    Block {
        body: String,
        redirect_words: Vec<Word>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub segments: Vec<Segment>,
    pub background: bool,
    pub negate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Pipeline(Pipeline),
    FunctionDef { header: Vec<Word>, body: String },
}

/// Words in command position: the first word, and the first word after
/// every pipe, skipping `not` prefixes.
fn command_words(tokens: &[Token]) -> Vec<&Word> {
    let mut out = Vec::new();
    let mut at_command = true;
    for token in tokens {
        match token {
            Token::Pipe => at_command = true,
            Token::Word(word) => {
                if at_command {
                    if is_keyword(word, "not") {
                        continue;
                    }
                    out.push(word);
                    at_command = false;
                }
            }
        }
    }
    out
}

fn nesting_delta(tokens: &[Token]) -> i32 {
    let mut delta = 0;
    for word in command_words(tokens) {
        if is_keyword(word, "begin") || is_keyword(word, "function") {
            delta += 1;
        } else if is_keyword(word, "end") {
            delta -= 1;
        }
    }
    delta
}

/// Parse a plain statement (no block constructs) into a pipeline.
fn parse_pipeline(tokens: &[Token], background: bool) -> Result<Pipeline, String> {
    let mut negate = false;
    let mut rest = tokens;
    while let Some(Token::Word(word)) = rest.first() {
        if is_keyword(word, "not") {
            negate = !negate;
            rest = &rest[1..];
        } else {
            break;
        }
    }

    let mut segments = Vec::new();
    let mut words: Vec<Word> = Vec::new();
    for token in rest {
        match token {
            Token::Word(word) => words.push(word.clone()),
            Token::Pipe => {
                if words.is_empty() {
                    return Err("syntax error near '|'".to_string());
                }
                segments.push(Segment::Simple(std::mem::take(&mut words)));
            }
        }
    }
    if words.is_empty() {
        return Err(if segments.is_empty() {
            "empty statement".to_string()
        } else {
            "syntax error: pipeline ends with '|'".to_string()
        });
    }
    segments.push(Segment::Simple(words));

    Ok(Pipeline {
        segments,
        background,
        negate,
    })
}

/// Rebuild block body text from its raw statements, preserving
/// backgrounding.
fn join_body(statements: &[RawStatement]) -> String {
    let mut body = String::new();
    for stmt in statements {
        body.push_str(&stmt.text);
        if stmt.terminator == '&' {
            body.push_str(" &");
        }
        body.push('\n');
    }
    body
}

/// Assemble a grouped `function`/`begin` construct.
///
/// Supported shapes: a `function name …; body; end` definition, and a
/// `begin` block optionally embedded in a pipeline (`begin … end | cmd`,
/// `cmd | begin … end`) with redirections after the closing `end`.
fn parse_group(statements: &[RawStatement]) -> Result<Statement, String> {
    let first_tokens = tokenize(&statements[0].text)?;
    let closing = statements.last().unwrap();
    let closing_tokens = tokenize(&closing.text)?;
    let background = closing.terminator == '&';
    let body = join_body(&statements[1..statements.len() - 1]);

    // function NAME [options]; body; end
    if let Some(Token::Word(word)) = first_tokens.first() {
        if is_keyword(word, "function") {
            if first_tokens.iter().any(|t| matches!(t, Token::Pipe)) {
                return Err("'function' cannot be part of a pipeline".to_string());
            }
            if closing_tokens.len() != 1 {
                return Err("unexpected tokens after 'end'".to_string());
            }
            let header: Vec<Word> = first_tokens[1..]
                .iter()
                .map(|t| match t {
                    Token::Word(w) => w.clone(),
                    Token::Pipe => unreachable!(),
                })
                .collect();
            if header.is_empty() {
                return Err("function: missing name".to_string());
            }
            return Ok(Statement::FunctionDef { header, body });
        }
    }

    // [upstream |] begin … end [redirects] [| downstream]
    let mut segments = Vec::new();
    let opener_words: Vec<&Token> = first_tokens.iter().collect();
    let begin_pos = opener_words
        .iter()
        .position(|t| matches!(t, Token::Word(w) if is_keyword(w, "begin")))
        .ok_or_else(|| "expected 'begin'".to_string())?;
    if begin_pos != opener_words.len() - 1 {
        return Err("unexpected tokens after 'begin'".to_string());
    }
    let mut negate = false;
    if begin_pos > 0 {
        let upstream = parse_pipeline(&first_tokens[..begin_pos - 1], false)?;
        // The opener line reads `upstream | begin`, so the token before
        // `begin` must be the pipe.
        if !matches!(first_tokens[begin_pos - 1], Token::Pipe) {
            return Err("expected '|' before 'begin'".to_string());
        }
        negate = upstream.negate;
        segments.extend(upstream.segments);
    }

    // Closing statement: end [redirect words] [| downstream]
    if !matches!(&closing_tokens[0], Token::Word(w) if is_keyword(w, "end")) {
        return Err("expected 'end'".to_string());
    }
    let mut redirect_words = Vec::new();
    let mut idx = 1;
    while idx < closing_tokens.len() {
        match &closing_tokens[idx] {
            Token::Word(word) => redirect_words.push(word.clone()),
            Token::Pipe => break,
        }
        idx += 1;
    }
    segments.push(Segment::Block {
        body,
        redirect_words,
    });
    if idx < closing_tokens.len() {
        let downstream = parse_pipeline(&closing_tokens[idx + 1..], false)?;
        segments.extend(downstream.segments);
    }

    Ok(Statement::Pipeline(Pipeline {
        segments,
        background,
        negate,
    }))
}

/// Parse a source string into statements.
pub fn parse_source(source: &str) -> Result<Vec<Statement>, String> {
    let raw = split_statements(source)?;
    let mut out = Vec::new();
    let mut group: Vec<RawStatement> = Vec::new();
    let mut nesting = 0;

    for stmt in raw {
        let tokens = tokenize(&stmt.text)?;
        if tokens.is_empty() {
            continue;
        }
        let delta = nesting_delta(&tokens);
        if group.is_empty() {
            if delta > 0 {
                nesting = delta;
                group.push(stmt);
            } else if delta < 0 {
                return Err("'end' outside of a block".to_string());
            } else {
                out.push(Statement::Pipeline(parse_pipeline(
                    &tokens,
                    stmt.terminator == '&',
                )?));
            }
        } else {
            nesting += delta;
            group.push(stmt);
            if nesting <= 0 {
                out.push(parse_group(&group)?);
                group.clear();
            }
        }
    }

    if !group.is_empty() {
        return Err("missing 'end'".to_string());
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_words(stmt: &Statement) -> Vec<String> {
        let Statement::Pipeline(pipeline) = stmt else {
            panic!("expected pipeline");
        };
        let Segment::Simple(words) = &pipeline.segments[0] else {
            panic!("expected simple segment");
        };
        words.iter().map(word_text).collect()
    }

    #[test]
    fn simple_command() {
        let stmts = parse_source("echo hello world").unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(simple_words(&stmts[0]), vec!["echo", "hello", "world"]);
    }

    #[test]
    fn double_quotes_preserve_spaces() {
        let stmts = parse_source(r#"echo "hello   world""#).unwrap();
        assert_eq!(simple_words(&stmts[0]), vec!["echo", "hello   world"]);
    }

    #[test]
    fn single_quotes_are_literal() {
        let tokens = tokenize(r"'hello\nworld'").unwrap();
        assert_eq!(
            tokens,
            vec![Token::Word(vec![WordSegment::SingleQuoted(
                r"hello\nworld".into()
            )])]
        );
    }

    #[test]
    fn backslash_escapes_space() {
        let stmts = parse_source(r"echo hello\ world").unwrap();
        assert_eq!(simple_words(&stmts[0]), vec!["echo", "hello world"]);
    }

    #[test]
    fn quotes_mid_word_merge_into_one_word() {
        let tokens = tokenize(r#"he"llo wor"ld"#).unwrap();
        assert_eq!(tokens.len(), 1);
        let Token::Word(word) = &tokens[0] else {
            panic!();
        };
        assert_eq!(word_text(word), "hello world");
        assert_eq!(word.len(), 3);
    }

    #[test]
    fn pipeline_splits_into_segments() {
        let stmts = parse_source("echo hi | cat | wc -l").unwrap();
        let Statement::Pipeline(pipeline) = &stmts[0] else {
            panic!();
        };
        assert_eq!(pipeline.segments.len(), 3);
        assert!(!pipeline.background);
    }

    #[test]
    fn trailing_ampersand_backgrounds() {
        let stmts = parse_source("sleep 10 &").unwrap();
        let Statement::Pipeline(pipeline) = &stmts[0] else {
            panic!();
        };
        assert!(pipeline.background);
    }

    #[test]
    fn not_prefix_sets_negate() {
        let stmts = parse_source("not false").unwrap();
        let Statement::Pipeline(pipeline) = &stmts[0] else {
            panic!();
        };
        assert!(pipeline.negate);
        assert_eq!(simple_words(&stmts[0]), vec!["false"]);
    }

    #[test]
    fn semicolons_separate_statements() {
        let stmts = parse_source("false; echo $status").unwrap();
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn comments_are_ignored() {
        let stmts = parse_source("echo one # echo two\necho three").unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(simple_words(&stmts[0]), vec!["echo", "one"]);
    }

    #[test]
    fn function_definition_collects_body() {
        let stmts = parse_source("function greet; echo \"hi $argv\"; end").unwrap();
        assert_eq!(stmts.len(), 1);
        let Statement::FunctionDef { header, body } = &stmts[0] else {
            panic!("expected function definition");
        };
        assert_eq!(word_text(&header[0]), "greet");
        assert!(body.contains("echo"));
    }

    #[test]
    fn nested_constructs_group_to_outermost_end() {
        let stmts =
            parse_source("function outer; begin; echo deep; end; end; echo after").unwrap();
        assert_eq!(stmts.len(), 2);
        let Statement::FunctionDef { body, .. } = &stmts[0] else {
            panic!();
        };
        assert!(body.contains("begin"));
        assert!(body.contains("end"));
    }

    #[test]
    fn begin_block_in_pipeline() {
        let stmts = parse_source("begin; echo a; echo b; end | sort").unwrap();
        let Statement::Pipeline(pipeline) = &stmts[0] else {
            panic!();
        };
        assert_eq!(pipeline.segments.len(), 2);
        assert!(matches!(pipeline.segments[0], Segment::Block { .. }));
        assert!(matches!(pipeline.segments[1], Segment::Simple(_)));
    }

    #[test]
    fn block_redirections_attach_to_end() {
        let stmts = parse_source("begin; echo a; end > out.txt").unwrap();
        let Statement::Pipeline(pipeline) = &stmts[0] else {
            panic!();
        };
        let Segment::Block { redirect_words, .. } = &pipeline.segments[0] else {
            panic!();
        };
        assert_eq!(redirect_words.len(), 2);
    }

    #[test]
    fn command_substitution_stays_one_word() {
        let tokens = tokenize("echo prefix-(echo inner here)-suffix").unwrap();
        assert_eq!(tokens.len(), 2);
        let Token::Word(word) = &tokens[1] else {
            panic!();
        };
        assert_eq!(word_text(word), "prefix-(echo inner here)-suffix");
    }

    #[test]
    fn semicolons_inside_substitutions_do_not_split() {
        let stmts = parse_source("echo (echo a; echo b)").unwrap();
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn unbalanced_parenthesis_is_an_error() {
        assert!(parse_source("echo (broken").is_err());
    }

    #[test]
    fn missing_end_is_an_error() {
        assert!(parse_source("function broken; echo hi").is_err());
        assert!(parse_source("end").is_err());
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(parse_source("echo \"unterminated").is_err());
    }

    #[test]
    fn empty_input_yields_no_statements() {
        assert!(parse_source("").unwrap().is_empty());
        assert!(parse_source("   \n  ; ; \n").unwrap().is_empty());
    }
}
