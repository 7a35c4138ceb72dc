//! Recursive-descent parser for the keep-rule configuration language.
//!
//! The parser never aborts: diagnostics go to stderr with token context and
//! errors are tallied in [`Stats`]. Failed clauses are skipped up to the next
//! directive or semicolon so one bad rule does not take the rest of the file
//! with it.

use std::fs;
use std::path::{Path, PathBuf};

use crate::ir::AccessFlags;
use crate::rules::lexer::{lex, Token, TokenKind};
use crate::rules::wildcards::convert_wildcard_type;
use crate::rules::{ClassNameSpec, ClassSpec, KeepSpec, KeepSpecSet, MemberSpec, RuleDatabase, Stats};

struct TokenCursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> TokenCursor<'a> {
    fn new(tokens: &'a [Token]) -> TokenCursor<'a> {
        let mut cursor = TokenCursor { tokens, pos: 0 };
        cursor.skip_comments();
        cursor
    }

    fn skip_comments(&mut self) {
        while self
            .tokens
            .get(self.pos)
            .is_some_and(|t| t.kind == TokenKind::Comment)
        {
            self.pos += 1;
        }
    }

    fn token(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> TokenKind {
        self.token().kind
    }

    fn data(&self) -> &str {
        &self.token().text
    }

    fn line(&self) -> usize {
        self.token().line
    }

    fn show(&self) -> &str {
        self.token().show()
    }

    fn is_command(&self) -> bool {
        self.kind().is_command()
    }

    /// Advance past the current token, skipping comments. A no-op at eof.
    fn next(&mut self) {
        if self.kind() == TokenKind::Eof {
            return;
        }
        self.pos += 1;
        self.skip_comments();
    }

    fn str_next(&mut self) -> String {
        let text = self.data().to_string();
        self.next();
        text
    }

    /// Peek the kind `n` non-comment tokens ahead of the cursor.
    fn peek_kind(&self, n: usize) -> TokenKind {
        let mut pos = self.pos;
        let mut remaining = n;
        while remaining > 0 {
            pos += 1;
            while self
                .tokens
                .get(pos)
                .is_some_and(|t| t.kind == TokenKind::Comment)
            {
                pos += 1;
            }
            remaining -= 1;
        }
        self.tokens
            .get(pos)
            .map_or(TokenKind::Eof, |t| t.kind)
    }

    /// Pretty-print the tokens on the lines surrounding the cursor, marking
    /// the current token with `!>` `<!`.
    fn show_context(&self, lines: usize) -> String {
        let this_line = self.line();
        let lo = this_line.saturating_sub(lines);
        let hi = this_line + lines;
        let mut out = String::new();
        let mut last_line: Option<usize> = None;
        for (i, tok) in self.tokens.iter().enumerate() {
            if tok.kind == TokenKind::Eof || tok.line < lo || tok.line > hi {
                continue;
            }
            if last_line != Some(tok.line) {
                if last_line.is_some() {
                    out.push('\n');
                }
                out.push_str(&tok.line.to_string());
                out.push_str(": ");
                last_line = Some(tok.line);
            } else {
                out.push(' ');
            }
            if i == self.pos {
                out.push_str("!>");
            }
            out.push_str(tok.show());
            if i == self.pos {
                out.push_str("<!");
            }
        }
        out
    }
}

fn skip_to_next_command(idx: &mut TokenCursor) {
    while idx.kind() != TokenKind::Eof && !idx.is_command() {
        idx.next();
    }
}

fn skip_to_semicolon(idx: &mut TokenCursor) {
    while idx.kind() != TokenKind::SemiColon && idx.kind() != TokenKind::Eof {
        idx.next();
    }
    if idx.kind() == TokenKind::SemiColon {
        idx.next();
    }
}

/// Consume the command token and one following filepath. Returns the empty
/// string (after a diagnostic) when the argument is missing or malformed.
fn parse_single_filepath_command(idx: &mut TokenCursor) -> String {
    let line_number = idx.line();
    idx.next(); // Consume the command token.
    if idx.kind() == TokenKind::Eof {
        eprintln!(
            "Expecting at least one file as an argument but found end of file at line {}\n{}",
            line_number,
            idx.show_context(2)
        );
        return String::new();
    }
    if idx.is_command() {
        eprintln!(
            "Expecting a file path argument but got command {} at line {}\n{}",
            idx.show(),
            idx.line(),
            idx.show_context(2)
        );
        return String::new();
    }
    if idx.kind() != TokenKind::Filepath {
        eprintln!(
            "Expected a filepath but got {} at line {}\n{}",
            idx.show(),
            idx.line(),
            idx.show_context(2)
        );
        return String::new();
    }
    idx.str_next()
}

/// Collect consecutive filepath tokens. In the non-optional form a bad
/// leading token produces a diagnostic but still yields the empty list; the
/// caller's empty-check turns that into a parse error.
fn parse_filepaths(idx: &mut TokenCursor, optional: bool) -> Vec<String> {
    if idx.kind() != TokenKind::Filepath && !optional {
        eprintln!(
            "Expected filepath but got {} at line {}\n{}",
            idx.show(),
            idx.line(),
            idx.show_context(2)
        );
    }
    let mut res = Vec::new();
    while idx.kind() == TokenKind::Filepath {
        res.push(idx.str_next());
    }
    res
}

fn parse_filepath_command(idx: &mut TokenCursor) -> Vec<String> {
    let line_number = idx.line();
    idx.next(); // Consume the command token.
    if idx.kind() == TokenKind::Eof {
        eprintln!(
            "Expecting at least one file as an argument but found end of file at line {}",
            line_number
        );
        return Vec::new();
    }
    if idx.is_command() {
        eprintln!(
            "Expecting a file path argument but got command {} at line {}\n{}",
            idx.show(),
            idx.line(),
            idx.show_context(2)
        );
        return Vec::new();
    }
    if idx.kind() != TokenKind::Filepath {
        eprintln!(
            "Expected a filepath but got {} at line {}\n{}",
            idx.show(),
            idx.line(),
            idx.show_context(2)
        );
        return Vec::new();
    }
    parse_filepaths(idx, false)
}

fn parse_optional_filepath_command(idx: &mut TokenCursor) -> Vec<String> {
    idx.next(); // Consume the command token.
    parse_filepaths(idx, true)
}

fn parse_jars(idx: &mut TokenCursor) -> Vec<String> {
    let line_number = idx.line();
    idx.next(); // Consume the jar command token.
    if idx.kind() == TokenKind::Eof {
        eprintln!(
            "Expecting at least one file as an argument but found end of file at line {}\n{}",
            line_number,
            idx.show_context(2)
        );
        return Vec::new();
    }
    parse_filepaths(idx, false)
}

fn parse_target(idx: &mut TokenCursor) -> String {
    idx.next(); // Consume the target command token.
    if idx.kind() != TokenKind::TargetVersion {
        eprintln!(
            "Expected a target version but got {} at line {}\n{}",
            idx.show(),
            idx.line(),
            idx.show_context(2)
        );
        return String::new();
    }
    idx.str_next()
}

fn parse_filter_list_command(idx: &mut TokenCursor) -> Vec<String> {
    idx.next();
    let mut filters = Vec::new();
    while idx.kind() == TokenKind::FilterPattern {
        filters.push(idx.str_next());
    }
    filters
}

/// Consumes the count token even when the cursor is not a number; a missing
/// count at end-of-input is the only failure. (Odd, but user-visible.)
fn parse_optimizationpasses_command(idx: &mut TokenCursor) -> bool {
    idx.next();
    if idx.kind() == TokenKind::Eof {
        return false;
    }
    idx.next();
    true
}

fn parse_repackageclasses(idx: &mut TokenCursor) {
    // Ignore repackageclasses.
    idx.next();
    if idx.kind() == TokenKind::Identifier {
        eprintln!(
            "Ignoring -repackageclasses {}\n{}",
            idx.data(),
            idx.show_context(2)
        );
        idx.next();
    }
}

fn is_modifier(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::IncludeDescriptorClasses
            | TokenKind::AllowShrinking
            | TokenKind::AllowOptimization
            | TokenKind::AllowObfuscation
    )
}

fn parse_modifiers(idx: &mut TokenCursor, keep: &mut KeepSpec) -> bool {
    while idx.kind() == TokenKind::Comma {
        idx.next();
        if !is_modifier(idx.kind()) {
            eprintln!(
                "Expected keep option modifier but found: {} at line number {}\n{}",
                idx.show(),
                idx.line(),
                idx.show_context(2)
            );
            return false;
        }
        match idx.kind() {
            TokenKind::IncludeDescriptorClasses => keep.includedescriptorclasses = true,
            TokenKind::AllowShrinking => keep.allowshrinking = true,
            TokenKind::AllowOptimization => keep.allowoptimization = true,
            TokenKind::AllowObfuscation => keep.allowobfuscation = true,
            _ => {}
        }
        idx.next();
    }
    true
}

fn process_access_modifier(kind: TokenKind) -> Option<AccessFlags> {
    match kind {
        TokenKind::Public => Some(AccessFlags::PUBLIC),
        TokenKind::Private => Some(AccessFlags::PRIVATE),
        TokenKind::Protected => Some(AccessFlags::PROTECTED),
        TokenKind::Static => Some(AccessFlags::STATIC),
        TokenKind::Final => Some(AccessFlags::FINAL),
        TokenKind::Abstract => Some(AccessFlags::ABSTRACT),
        TokenKind::Synthetic => Some(AccessFlags::SYNTHETIC),
        TokenKind::Volatile => Some(AccessFlags::VOLATILE),
        TokenKind::Native => Some(AccessFlags::NATIVE),
        TokenKind::Transient => Some(AccessFlags::TRANSIENT),
        _ => None,
    }
}

fn is_negation_or_class_access_modifier(kind: TokenKind) -> bool {
    kind == TokenKind::Not || process_access_modifier(kind).is_some()
}

fn parse_access_flags(
    idx: &mut TokenCursor,
    set_flags: &mut AccessFlags,
    unset_flags: &mut AccessFlags,
) -> bool {
    while is_negation_or_class_access_modifier(idx.kind()) {
        // Peek past a '!' so a negation belonging to the class token (e.g.
        // `!interface`) is left for the class-token parser.
        let negated = idx.kind() == TokenKind::Not;
        let flag_kind = if negated { idx.peek_kind(1) } else { idx.kind() };
        let Some(flag) = process_access_modifier(flag_kind) else {
            break;
        };
        if negated {
            idx.next(); // Consume the '!'.
        }
        if negated {
            if set_flags.contains(flag) {
                eprintln!(
                    "Access flag {} occurs with conflicting settings at line {}\n{}",
                    idx.show(),
                    idx.line(),
                    idx.show_context(2)
                );
                return false;
            }
            *unset_flags |= flag;
        } else {
            if unset_flags.contains(flag) {
                eprintln!(
                    "Access flag {} occurs with conflicting settings at line {}\n{}",
                    idx.show(),
                    idx.line(),
                    idx.show_context(2)
                );
                return false;
            }
            *set_flags |= flag;
        }
        idx.next(); // Consume the flag token.
    }
    true
}

/// Parse `[!](class|interface|enum|@interface)`.
fn parse_class_token(
    idx: &mut TokenCursor,
    set_flags: &mut AccessFlags,
    unset_flags: &mut AccessFlags,
) -> bool {
    let mut negated = false;
    if idx.kind() == TokenKind::Not {
        negated = true;
        idx.next();
    }
    let flag = match idx.kind() {
        TokenKind::Interface => Some(AccessFlags::INTERFACE),
        TokenKind::Enum => Some(AccessFlags::ENUM),
        TokenKind::Annotation => Some(AccessFlags::ANNOTATION),
        TokenKind::Class => None,
        _ => {
            eprintln!(
                "Expected interface, class or enum but got {} at line number {}\n{}",
                idx.show(),
                idx.line(),
                idx.show_context(2)
            );
            return false;
        }
    };
    if let Some(flag) = flag {
        if negated {
            *unset_flags |= flag;
        } else {
            *set_flags |= flag;
        }
    }
    idx.next();
    true
}

fn consume_token(idx: &mut TokenCursor, kind: TokenKind) -> bool {
    if idx.kind() != kind {
        eprintln!("Unexpected token {}\n{}", idx.show(), idx.show_context(2));
        return false;
    }
    idx.next();
    true
}

fn gobble_semicolon(idx: &mut TokenCursor) -> bool {
    if idx.kind() != TokenKind::SemiColon {
        eprintln!(
            "Expecting a semicolon but found {} at line {}\n{}",
            idx.show(),
            idx.line(),
            idx.show_context(2)
        );
        return false;
    }
    idx.next();
    true
}

fn parse_annotation_type(idx: &mut TokenCursor) -> String {
    if idx.kind() != TokenKind::AnnotationApplication {
        return String::new();
    }
    idx.next();
    if idx.kind() != TokenKind::Identifier {
        eprintln!(
            "Expecting a class identifier after @ but got {} at line {}\n{}",
            idx.show(),
            idx.line(),
            idx.show_context(2)
        );
        return String::new();
    }
    let typ = idx.str_next();
    convert_wildcard_type(&typ)
}

fn parse_member_specification(
    idx: &mut TokenCursor,
    class_spec: &mut ClassSpec,
    allow_return: bool,
) -> bool {
    let mut member = MemberSpec {
        annotation_type: parse_annotation_type(idx),
        ..MemberSpec::default()
    };
    if !parse_access_flags(
        idx,
        &mut member.required_set_access,
        &mut member.required_unset_access,
    ) {
        eprintln!("Problem parsing access flags for member specification.");
        skip_to_semicolon(idx);
        return false;
    }
    if idx.kind() != TokenKind::Identifier {
        eprintln!(
            "Expecting field or member specification but got {} at line {}\n{}",
            idx.show(),
            idx.line(),
            idx.show_context(2)
        );
        skip_to_semicolon(idx);
        return false;
    }
    let ident = idx.data().to_string();
    // The wildcard member applies to both fields and methods.
    if ident == "*" {
        idx.next();
        if !gobble_semicolon(idx) {
            return false;
        }
        class_spec.method_specs.push(member.clone());
        class_spec.field_specs.push(member);
        return true;
    }
    if ident == "<methods>" {
        idx.next();
        if !gobble_semicolon(idx) {
            return false;
        }
        class_spec.method_specs.push(member);
        return true;
    }
    if ident == "<fields>" {
        idx.next();
        if !gobble_semicolon(idx) {
            return false;
        }
        class_spec.field_specs.push(member);
        return true;
    }
    if ident == "<init>" {
        member.name = "<init>".to_string();
        member.descriptor = "V".to_string();
        member.required_set_access |= AccessFlags::CONSTRUCTOR;
        idx.next();
    } else {
        // This token is the type of the member specification.
        let typ = idx.str_next();
        member.descriptor = convert_wildcard_type(&typ);
        if idx.kind() != TokenKind::Identifier {
            eprintln!(
                "Expecting identifier name for class member but got {} at line {}\n{}",
                idx.show(),
                idx.line(),
                idx.show_context(2)
            );
            skip_to_semicolon(idx);
            return false;
        }
        member.name = idx.str_next();
    }
    // A following argument list makes this a method specification.
    if idx.kind() == TokenKind::OpenBracket {
        consume_token(idx, TokenKind::OpenBracket);
        let mut arg = String::from("(");
        loop {
            if idx.kind() == TokenKind::CloseBracket {
                consume_token(idx, TokenKind::CloseBracket);
                break;
            }
            if idx.kind() != TokenKind::Identifier {
                eprintln!(
                    "Expecting type identifier but got {} at line {}\n{}",
                    idx.show(),
                    idx.line(),
                    idx.show_context(2)
                );
                return false;
            }
            let typ = idx.str_next();
            arg.push_str(&convert_wildcard_type(&typ));
            if idx.kind() != TokenKind::Comma && idx.kind() != TokenKind::CloseBracket {
                eprintln!(
                    "Expecting comma or ) but got {} at line {}\n{}",
                    idx.show(),
                    idx.line(),
                    idx.show_context(2)
                );
                return false;
            }
            if idx.kind() == TokenKind::Comma {
                consume_token(idx, TokenKind::Comma);
                if idx.kind() != TokenKind::Identifier {
                    eprintln!(
                        "Expecting type identifier after comma but got {} at line {}\n{}",
                        idx.show(),
                        idx.line(),
                        idx.show_context(2)
                    );
                    return false;
                }
            }
        }
        arg.push(')');
        arg.push_str(&member.descriptor);
        member.descriptor = arg;
    }
    if allow_return && idx.kind() == TokenKind::Returns {
        idx.next();
        match idx.data() {
            "true" => {
                member.return_value = Some(true);
                idx.next();
            }
            "false" => {
                member.return_value = Some(false);
                idx.next();
            }
            _ => {}
        }
    }
    if !gobble_semicolon(idx) {
        return false;
    }
    if member.descriptor.starts_with('(') {
        class_spec.method_specs.push(member);
    } else {
        class_spec.field_specs.push(member);
    }
    true
}

fn parse_member_specifications(
    idx: &mut TokenCursor,
    class_spec: &mut ClassSpec,
    allow_return: bool,
) -> bool {
    let mut ok = true;
    if idx.kind() == TokenKind::OpenCurly {
        idx.next();
        while idx.kind() != TokenKind::CloseCurly && idx.kind() != TokenKind::Eof {
            if !parse_member_specification(idx, class_spec, allow_return) {
                skip_to_semicolon(idx);
                ok = false;
            }
        }
        if idx.kind() == TokenKind::CloseCurly {
            idx.next();
        }
    }
    ok
}

fn parse_class_name(idx: &mut TokenCursor) -> Option<String> {
    if idx.kind() != TokenKind::Identifier {
        eprintln!(
            "Expected class name but got {} at line {}\n{}",
            idx.show(),
            idx.line(),
            idx.show_context(2)
        );
        return None;
    }
    Some(idx.str_next())
}

fn parse_class_names(idx: &mut TokenCursor, class_names: &mut Vec<ClassNameSpec>) -> bool {
    let mut parse_one = |idx: &mut TokenCursor| -> bool {
        let mut negated = false;
        if idx.kind() == TokenKind::Not {
            negated = true;
            idx.next();
        }
        match parse_class_name(idx) {
            Some(pattern) => {
                class_names.push(ClassNameSpec { pattern, negated });
                true
            }
            None => false,
        }
    };

    if !parse_one(idx) {
        return false;
    }
    while idx.kind() == TokenKind::Comma {
        idx.next();
        if !parse_one(idx) {
            return false;
        }
    }
    true
}

fn parse_class_specification(idx: &mut TokenCursor, allow_return: bool) -> Option<ClassSpec> {
    let mut class_spec = ClassSpec {
        annotation_type: parse_annotation_type(idx),
        ..ClassSpec::default()
    };
    if !parse_access_flags(
        idx,
        &mut class_spec.required_set_access,
        &mut class_spec.required_unset_access,
    ) {
        eprintln!("Problem parsing access flags for class specification.");
        return None;
    }
    if !parse_class_token(
        idx,
        &mut class_spec.required_set_access,
        &mut class_spec.required_unset_access,
    ) {
        return None;
    }
    if !parse_class_names(idx, &mut class_spec.class_names) {
        return None;
    }
    let mut ok = true;
    // Parse extends/implements if present, treating implements like extends.
    if idx.kind() == TokenKind::Extends || idx.kind() == TokenKind::Implements {
        idx.next();
        class_spec.extends_annotation_type = parse_annotation_type(idx);
        if idx.kind() != TokenKind::Identifier {
            eprintln!(
                "Expecting a class name after extends/implements but got {} at line {}\n{}",
                idx.show(),
                idx.line(),
                idx.show_context(2)
            );
            ok = false;
            class_spec.extends_class_name = String::new();
        } else {
            class_spec.extends_class_name = idx.str_next();
        }
    }
    let member_ok = parse_member_specifications(idx, &mut class_spec, allow_return);
    if !ok || !member_ok {
        return None;
    }
    class_spec.field_specs.sort_by(|a, b| a.name.cmp(&b.name));
    class_spec.method_specs.sort_by(|a, b| a.name.cmp(&b.name));
    Some(class_spec)
}

#[derive(Clone, Copy)]
enum KeepTarget {
    Keep,
    AssumeNoSideEffects,
    AssumeValues,
    WhyAreYouKeeping,
}

struct KeepSpecDesc {
    token_kind: TokenKind,
    target: KeepTarget,
    mark_classes: bool,
    mark_conditionally: bool,
    allowshrinking: bool,
    allow_return: bool,
}

const KEEP_SPECS: [KeepSpecDesc; 9] = [
    KeepSpecDesc {
        token_kind: TokenKind::Keep,
        target: KeepTarget::Keep,
        mark_classes: true,
        mark_conditionally: false,
        allowshrinking: false,
        allow_return: false,
    },
    KeepSpecDesc {
        token_kind: TokenKind::KeepClassMembers,
        target: KeepTarget::Keep,
        mark_classes: false,
        mark_conditionally: false,
        allowshrinking: false,
        allow_return: false,
    },
    KeepSpecDesc {
        token_kind: TokenKind::KeepClassesWithMembers,
        target: KeepTarget::Keep,
        mark_classes: false,
        mark_conditionally: true,
        allowshrinking: false,
        allow_return: false,
    },
    KeepSpecDesc {
        token_kind: TokenKind::KeepNames,
        target: KeepTarget::Keep,
        mark_classes: true,
        mark_conditionally: false,
        allowshrinking: true,
        allow_return: false,
    },
    KeepSpecDesc {
        token_kind: TokenKind::KeepClassMemberNames,
        target: KeepTarget::Keep,
        mark_classes: false,
        mark_conditionally: false,
        allowshrinking: true,
        allow_return: false,
    },
    KeepSpecDesc {
        token_kind: TokenKind::KeepClassesWithMemberNames,
        target: KeepTarget::Keep,
        mark_classes: false,
        mark_conditionally: true,
        allowshrinking: true,
        allow_return: false,
    },
    KeepSpecDesc {
        token_kind: TokenKind::AssumeNoSideEffects,
        target: KeepTarget::AssumeNoSideEffects,
        mark_classes: false,
        mark_conditionally: false,
        allowshrinking: false,
        allow_return: true,
    },
    KeepSpecDesc {
        token_kind: TokenKind::AssumeValues,
        target: KeepTarget::AssumeValues,
        mark_classes: false,
        mark_conditionally: false,
        allowshrinking: false,
        allow_return: true,
    },
    KeepSpecDesc {
        token_kind: TokenKind::WhyAreYouKeeping,
        target: KeepTarget::WhyAreYouKeeping,
        mark_classes: false,
        mark_conditionally: false,
        allowshrinking: false,
        allow_return: false,
    },
];

impl KeepTarget {
    fn spec_set<'a>(&self, db: &'a mut RuleDatabase) -> &'a mut KeepSpecSet {
        match self {
            KeepTarget::Keep => &mut db.keep_rules,
            KeepTarget::AssumeNoSideEffects => &mut db.assume_no_side_effects_rules,
            KeepTarget::AssumeValues => &mut db.assume_values_rules,
            KeepTarget::WhyAreYouKeeping => &mut db.why_are_you_keeping_rules,
        }
    }
}

/// Parse a keep-style clause. Returns whether the class specification was
/// valid; the clause is still recorded, partially populated, when it was not.
fn parse_keep(
    idx: &mut TokenCursor,
    desc: &KeepSpecDesc,
    spec_set: &mut KeepSpecSet,
    filename: &str,
    line: usize,
) -> bool {
    idx.next(); // Consume the keep token.
    let mut keep = KeepSpec {
        mark_classes: desc.mark_classes,
        mark_conditionally: desc.mark_conditionally,
        allowshrinking: desc.allowshrinking,
        source_filename: filename.to_string(),
        source_line: line,
        ..KeepSpec::default()
    };
    if !parse_modifiers(idx, &mut keep) {
        skip_to_next_command(idx);
        return false;
    }
    let class_spec = parse_class_specification(idx, desc.allow_return);
    let ok = class_spec.is_some();
    if let Some(class_spec) = class_spec {
        keep.class_spec = class_spec;
    }
    spec_set.push(keep);
    ok
}

fn parse_tokens(tokens: &[Token], db: &mut RuleDatabase, stats: &mut Stats, filename: &str) {
    let mut idx = TokenCursor::new(tokens);

    while idx.kind() != TokenKind::Eof {
        let line = idx.line();
        if !idx.is_command() {
            eprintln!(
                "Expecting command but found {} at line {}\n{}",
                idx.show(),
                idx.line(),
                idx.show_context(2)
            );
            idx.next();
            skip_to_next_command(&mut idx);
            stats.unknown_commands += 1;
            continue;
        }

        match idx.kind() {
            TokenKind::Include => {
                let fp = parse_filepath_command(&mut idx);
                if fp.is_empty() {
                    stats.parse_errors += 1;
                }
                db.includes.extend(fp);
            }
            TokenKind::BaseDirectory => {
                let path = parse_single_filepath_command(&mut idx);
                if path.is_empty() {
                    stats.parse_errors += 1;
                }
                db.basedirectory = path;
            }
            TokenKind::InJars => {
                let jars = parse_jars(&mut idx);
                if jars.is_empty() {
                    stats.parse_errors += 1;
                }
                db.injars.extend(jars);
            }
            TokenKind::OutJars => {
                let jars = parse_jars(&mut idx);
                if jars.is_empty() {
                    stats.parse_errors += 1;
                }
                db.outjars.extend(jars);
            }
            TokenKind::LibraryJars => {
                let jars = parse_jars(&mut idx);
                if jars.is_empty() {
                    stats.parse_errors += 1;
                }
                db.libraryjars.extend(jars);
            }
            TokenKind::KeepDirectories => {
                let fp = parse_filepath_command(&mut idx);
                if fp.is_empty() {
                    stats.parse_errors += 1;
                }
                db.keepdirectories.extend(fp);
            }
            TokenKind::Target => {
                let target = parse_target(&mut idx);
                if !target.is_empty() {
                    db.target_version = target;
                }
            }
            TokenKind::DontSkipNonPublicLibraryClasses => {
                // Silently ignored; the option has no effect here.
                idx.next();
            }
            TokenKind::Keep
            | TokenKind::KeepClassMembers
            | TokenKind::KeepClassesWithMembers
            | TokenKind::KeepNames
            | TokenKind::KeepClassMemberNames
            | TokenKind::KeepClassesWithMemberNames
            | TokenKind::AssumeNoSideEffects
            | TokenKind::AssumeValues
            | TokenKind::WhyAreYouKeeping => {
                for desc in &KEEP_SPECS {
                    if desc.token_kind == idx.kind() {
                        let mut spec_set = std::mem::take(desc.target.spec_set(db));
                        let ok = parse_keep(&mut idx, desc, &mut spec_set, filename, line);
                        *desc.target.spec_set(db) = spec_set;
                        if !ok {
                            stats.parse_errors += 1;
                        }
                        break;
                    }
                }
            }
            TokenKind::PrintSeeds => {
                db.printseeds.extend(parse_optional_filepath_command(&mut idx));
            }
            TokenKind::PrintUsage => {
                db.printusage.extend(parse_optional_filepath_command(&mut idx));
            }
            TokenKind::PrintMapping => {
                db.printmapping
                    .extend(parse_optional_filepath_command(&mut idx));
            }
            TokenKind::PrintConfiguration => {
                db.printconfiguration
                    .extend(parse_optional_filepath_command(&mut idx));
            }
            TokenKind::DontShrink => {
                idx.next();
                db.shrink = false;
            }
            TokenKind::DontOptimize => {
                idx.next();
                db.optimize = false;
            }
            TokenKind::Optimizations => {
                let filters = parse_filter_list_command(&mut idx);
                if filters.is_empty() {
                    stats.parse_errors += 1;
                }
                db.optimization_filters.extend(filters);
            }
            TokenKind::OptimizationPasses => {
                if !parse_optimizationpasses_command(&mut idx) {
                    stats.parse_errors += 1;
                }
            }
            TokenKind::AllowAccessModification => {
                idx.next();
                db.allowaccessmodification = true;
            }
            TokenKind::DontObfuscate => {
                idx.next();
                db.dontobfuscate = true;
            }
            TokenKind::RepackageClasses => {
                parse_repackageclasses(&mut idx);
            }
            TokenKind::KeepAttributes => {
                let filters = parse_filter_list_command(&mut idx);
                if filters.is_empty() {
                    stats.parse_errors += 1;
                }
                db.keepattributes.extend(filters);
            }
            TokenKind::DontUseMixedCaseClassNames => {
                idx.next();
                db.dontusemixedcaseclassnames = true;
            }
            TokenKind::KeepPackageNames => {
                let filters = parse_filter_list_command(&mut idx);
                if filters.is_empty() {
                    stats.parse_errors += 1;
                }
                db.keeppackagenames.extend(filters);
            }
            TokenKind::DontPreverify => {
                idx.next();
                db.dontpreverify = true;
            }
            TokenKind::DontWarn => {
                let filters = parse_filter_list_command(&mut idx);
                if filters.is_empty() {
                    stats.parse_errors += 1;
                }
                db.dontwarn.extend(filters);
            }
            TokenKind::Verbose => {
                idx.next();
                db.verbose = true;
            }
            TokenKind::Command => {
                // It is benign to drop -dontnote.
                if idx.data() != "-dontnote" {
                    eprintln!(
                        "Unimplemented command (skipping): {} at line {}\n{}",
                        idx.show(),
                        idx.line(),
                        idx.show_context(2)
                    );
                    stats.unimplemented += 1;
                }
                idx.next();
                skip_to_next_command(&mut idx);
            }
            _ => unreachable!("non-command token dispatched as command"),
        }
    }
}

/// Parse a configuration source into `db`, returning the error counters.
/// Lex-level failures (unknown tokens) abort semantic work on the source.
pub fn parse(config: &str, db: &mut RuleDatabase, filename: &str) -> Stats {
    let mut stats = Stats::default();
    let tokens = lex(config);

    stats.unknown_tokens = tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Unknown)
        .count();
    if stats.unknown_tokens > 0 {
        eprintln!(
            "Found {} unknown tokens in {}",
            stats.unknown_tokens, filename
        );
        db.ok = false;
        return stats;
    }

    parse_tokens(&tokens, db, &mut stats, filename);
    if stats.parse_errors == 0 && stats.unknown_commands == 0 && stats.unimplemented == 0 {
        db.ok = true;
    } else {
        db.ok = false;
        if stats.parse_errors > 0 {
            eprintln!("Found {} parse errors in {}", stats.parse_errors, filename);
        }
    }
    stats
}

/// Parse a configuration file and, transitively, everything it includes.
/// Each file is acquired at most once via the `already_included` guard.
pub fn parse_file(path: impl AsRef<Path>, db: &mut RuleDatabase) -> Stats {
    let path = path.as_ref();
    let mut stats = Stats::default();
    db.already_included.insert(path.to_string_lossy().into_owned());

    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            eprintln!("Failed to read {}: {}", path.display(), err);
            stats.parse_errors += 1;
            db.ok = false;
            return stats;
        }
    };
    stats += parse(&contents, db, &path.to_string_lossy());

    // Parse the included files; the list may grow while we walk it.
    let mut index = 0;
    while index < db.includes.len() {
        let included = db.includes[index].clone();
        index += 1;
        if db.already_included.contains(&included) {
            continue;
        }
        db.already_included.insert(included.clone());
        let resolved = resolve_include(&db.basedirectory, &included);
        stats += parse_file(resolved, db);
    }
    stats
}

fn resolve_include(basedirectory: &str, included: &str) -> PathBuf {
    let path = Path::new(included);
    if !basedirectory.is_empty() && path.is_relative() {
        Path::new(basedirectory).join(path)
    } else {
        path.to_path_buf()
    }
}

// The proguard-android-optimize.txt file that ships with the Android SDK has
// a keep rule preventing removal of all resource ID fields, plus a catch-all
// keepnames. Both are redundant here and hamper later passes, so they are
// stripped after parsing.
const DEFAULT_BLOCKLISTED_RULES: &str = r"
  -keepclassmembers class **.R$* {
    public static <fields>;
  }

  -keepnames class *
";

/// Remove the known-redundant SDK rules from `keep_rules` by structural
/// equality. Returns the number of rules removed.
pub fn remove_default_blocklisted_rules(db: &mut RuleDatabase) -> usize {
    remove_blocklisted_rules(DEFAULT_BLOCKLISTED_RULES, db)
}

pub fn remove_blocklisted_rules(rules: &str, db: &mut RuleDatabase) -> usize {
    let mut blocklist_db = RuleDatabase::new();
    parse(rules, &mut blocklist_db, "<internal blocklist>");
    db.keep_rules
        .erase_if(|ks| blocklist_db.keep_rules.iter().any(|b| b == ks))
}

// A "blanket native rule" keeps all native methods and their parent classes.
// They are moved to the tail of the keep-rule list so their effect on
// reachability can be analyzed in isolation.
const BLANKET_NATIVE_RULES: &str = r"
  -keep class * { native <methods>; }
  -keepclassmembers class * { native <methods>; }
  -keepclasseswithmembers class * { native <methods>; }
  -keepclasseswithmembernames class * { native <methods>; }
  -keep,includedescriptorclasses class ** { native <methods>; }
  -keepclassmembers,includedescriptorclasses class ** { native <methods>; }
  -keepclasseswithmembers,includedescriptorclasses class ** { native <methods>; }
  -keepclasseswithmembernames,includedescriptorclasses class ** { native <methods>; }
";

fn blanket_native_matches(ks: &KeepSpec, template: &KeepSpec) -> bool {
    // Class-level access qualifiers do not change what a blanket native rule
    // keeps, so the match is insensitive to them.
    let mut normalized = ks.clone();
    normalized.class_spec.required_set_access = template.class_spec.required_set_access;
    normalized.class_spec.required_unset_access = template.class_spec.required_unset_access;
    normalized == *template
}

/// Partition `keep_rules` so blanket native rules sit at the tail, recording
/// the boundary cursor on the database. Returns the size of the tail.
pub fn identify_blanket_native_rules(db: &mut RuleDatabase) -> usize {
    let mut tmp_db = RuleDatabase::new();
    parse(BLANKET_NATIVE_RULES, &mut tmp_db, "<blanket native rules>");

    let templates: Vec<KeepSpec> = tmp_db.keep_rules.iter().cloned().collect();
    let cursor = db
        .keep_rules
        .stable_partition(|ks| !templates.iter().any(|t| blanket_native_matches(ks, t)));
    db.keep_rules_native_begin = Some(cursor);
    db.keep_rules.len() - cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn parse_str(input: &str) -> (RuleDatabase, Stats) {
        let mut db = RuleDatabase::new();
        let stats = parse(input, &mut db, "<test>");
        (db, stats)
    }

    #[test]
    fn keep_with_constructor_member() {
        let (db, stats) = parse_str("-keep class com.Foo { public <init>(); }");
        assert_eq!(stats, Stats::default());
        assert!(db.ok);
        assert_eq!(db.keep_rules.len(), 1);
        let keep = db.keep_rules.iter().next().unwrap();
        assert!(keep.mark_classes);
        assert!(!keep.allowshrinking);
        assert_eq!(
            keep.class_spec.class_names,
            vec![ClassNameSpec {
                pattern: "com.Foo".to_string(),
                negated: false,
            }]
        );
        assert_eq!(keep.class_spec.method_specs.len(), 1);
        let init = &keep.class_spec.method_specs[0];
        assert_eq!(init.name, "<init>");
        assert_eq!(init.descriptor, "()V");
        assert!(init
            .required_set_access
            .contains(AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR));
    }

    #[test]
    fn keep_with_modifier_and_negated_class_names() {
        let (db, stats) = parse_str("-keep,allowobfuscation class !com.A,com.B { *; }");
        assert_eq!(stats.parse_errors, 0);
        let keep = db.keep_rules.iter().next().unwrap();
        assert!(keep.allowobfuscation);
        assert_eq!(keep.class_spec.class_names.len(), 2);
        assert!(keep.class_spec.class_names[0].negated);
        assert_eq!(keep.class_spec.class_names[1].pattern, "com.B");
        // The wildcard member lands in both lists.
        assert_eq!(keep.class_spec.method_specs.len(), 1);
        assert_eq!(keep.class_spec.field_specs.len(), 1);
        assert!(keep.class_spec.method_specs[0].name.is_empty());
    }

    #[test]
    fn conflicting_access_flags_count_one_parse_error() {
        let (db, stats) = parse_str("-keep public !public class com.Foo");
        assert_eq!(stats.parse_errors, 1);
        assert!(!db.ok);
        // The failing clause is still recorded, partially populated.
        assert_eq!(db.keep_rules.len(), 1);
        assert!(db.keep_rules.iter().next().unwrap().class_spec.class_names.is_empty());
    }

    #[test]
    fn assume_rules_target_their_own_sets() {
        let (db, _) = parse_str(
            "-assumenosideeffects class com.Log { int d(...); }\n\
             -assumevalues class com.Flags { boolean enabled() return true; }",
        );
        assert_eq!(db.assume_no_side_effects_rules.len(), 1);
        assert_eq!(db.assume_values_rules.len(), 1);
        let assume = db.assume_values_rules.iter().next().unwrap();
        assert_eq!(assume.class_spec.method_specs[0].return_value, Some(true));
    }

    #[test]
    fn unknown_command_is_counted_and_skipped() {
        let (db, stats) = parse_str("class stray\n-verbose");
        assert_eq!(stats.unknown_commands, 1);
        assert!(db.verbose);
        assert!(!db.ok);
    }

    #[test]
    fn unimplemented_command_counted_except_dontnote() {
        let (_, stats) = parse_str("-dontnote\n-mergeinterfacesaggressively\n-verbose");
        assert_eq!(stats.unimplemented, 1);
    }

    #[test]
    fn unknown_tokens_abort_the_file() {
        let (db, stats) = parse_str("-keep class \"com.Foo\"");
        assert!(stats.unknown_tokens > 0);
        assert!(!db.ok);
        assert!(db.keep_rules.is_empty());
    }

    #[test]
    fn filepath_lists_accumulate() {
        let (db, stats) = parse_str("-injars a.jar,b.jar\n-injars c.jar");
        assert_eq!(stats.parse_errors, 0);
        assert_eq!(db.injars, vec!["a.jar", "b.jar", "c.jar"]);
    }

    #[test]
    fn optional_filepath_may_be_empty() {
        let (db, stats) = parse_str("-printseeds\n-dontshrink");
        assert_eq!(stats.parse_errors, 0);
        assert!(db.printseeds.is_empty());
        assert!(!db.shrink);
    }

    #[test]
    fn optimizationpasses_eats_the_count() {
        let (db, stats) = parse_str("-optimizationpasses 5\n-verbose");
        assert_eq!(stats.parse_errors, 0);
        assert!(db.verbose);
        // Missing count at end of input is the error case.
        let (_, stats) = parse_str("-optimizationpasses");
        assert_eq!(stats.parse_errors, 1);
    }

    #[test]
    fn include_cycle_parses_once() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("cycle.pro");
        fs::write(
            &path,
            format!("-include {}\n-verbose\n", path.display()),
        )
        .expect("write cycle.pro");

        let mut db = RuleDatabase::new();
        let stats = parse_file(&path, &mut db);
        assert_eq!(stats.parse_errors, 0);
        assert!(db.verbose);
        // The file appears once in the include list and once in the guard.
        assert_eq!(db.includes.len(), 1);
        assert!(db
            .already_included
            .contains(&path.to_string_lossy().into_owned()));
    }

    #[test]
    fn includes_resolve_against_base_directory() {
        let dir = tempfile::tempdir().expect("create temp dir");
        fs::write(dir.path().join("extra.pro"), "-dontobfuscate\n").expect("write extra.pro");
        let main = dir.path().join("main.pro");
        fs::write(
            &main,
            format!("-basedirectory {}\n-include extra.pro\n", dir.path().display()),
        )
        .expect("write main.pro");

        let mut db = RuleDatabase::new();
        let stats = parse_file(&main, &mut db);
        assert_eq!(stats.parse_errors, 0);
        assert!(db.dontobfuscate);
    }

    #[test]
    fn default_blocklisted_rules_are_removed() {
        let (mut db, _) = parse_str(
            "-keepclassmembers class **.R$* {\n  public static <fields>;\n}\n\
             -keep class com.Keep { *; }",
        );
        assert_eq!(db.keep_rules.len(), 2);
        let removed = remove_default_blocklisted_rules(&mut db);
        assert_eq!(removed, 1);
        assert_eq!(db.keep_rules.len(), 1);
        let survivor = db.keep_rules.iter().next().unwrap();
        assert_eq!(survivor.class_spec.class_names[0].pattern, "com.Keep");
    }

    #[test]
    fn blanket_native_rules_move_to_the_tail() {
        let (mut db, _) = parse_str(
            "-keepclasseswithmembers public class * { native <methods>; }\n\
             -keep class com.App { *; }",
        );
        let count = identify_blanket_native_rules(&mut db);
        assert_eq!(count, 1);
        let cursor = db.keep_rules_native_begin.expect("partition cursor");
        assert_eq!(cursor, 1);
        let rules: Vec<&KeepSpec> = db.keep_rules.iter().collect();
        assert_eq!(rules[0].class_spec.class_names[0].pattern, "com.App");
        assert_eq!(rules[1].class_spec.class_names[0].pattern, "*");
    }

    #[test]
    fn member_specs_are_sorted_by_name() {
        let (db, _) = parse_str("-keep class com.Foo { int zebra; int alpha; }");
        let keep = db.keep_rules.iter().next().unwrap();
        let names: Vec<&str> = keep
            .class_spec
            .field_specs
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(names, vec!["alpha", "zebra"]);
    }
}
