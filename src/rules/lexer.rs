//! Lexer for the shrinker keep-rule configuration language.
//!
//! The lexer is modal: commands that take file paths, filter patterns, or a
//! version literal switch the scanner into a mode where the following words
//! are captured verbatim instead of being split on class-pattern punctuation.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenKind {
    // Directive keywords.
    Include,
    BaseDirectory,
    InJars,
    OutJars,
    LibraryJars,
    KeepDirectories,
    Target,
    DontSkipNonPublicLibraryClasses,
    Keep,
    KeepClassMembers,
    KeepClassesWithMembers,
    KeepNames,
    KeepClassMemberNames,
    KeepClassesWithMemberNames,
    AssumeNoSideEffects,
    AssumeValues,
    WhyAreYouKeeping,
    PrintSeeds,
    PrintUsage,
    PrintMapping,
    PrintConfiguration,
    DontShrink,
    DontOptimize,
    DontObfuscate,
    DontPreverify,
    Optimizations,
    OptimizationPasses,
    AllowAccessModification,
    DontUseMixedCaseClassNames,
    KeepAttributes,
    KeepPackageNames,
    DontWarn,
    Verbose,
    RepackageClasses,
    /// Any other `-word` directive.
    Command,
    // Structural punctuation.
    OpenCurly,
    CloseCurly,
    OpenBracket,
    CloseBracket,
    SemiColon,
    Colon,
    Comma,
    Not,
    // Class and member modifiers.
    Public,
    Private,
    Protected,
    Static,
    Final,
    Abstract,
    Synthetic,
    Volatile,
    Native,
    Transient,
    Synchronized,
    Strictfp,
    Bridge,
    Varargs,
    Class,
    Interface,
    Enum,
    /// `@interface`.
    Annotation,
    /// A bare `@` applying an annotation.
    AnnotationApplication,
    Extends,
    Implements,
    Returns,
    IncludeDescriptorClasses,
    AllowShrinking,
    AllowOptimization,
    AllowObfuscation,
    // Values.
    Identifier,
    Filepath,
    TargetVersion,
    FilterPattern,
    Comment,
    Eof,
    Unknown,
}

impl TokenKind {
    pub fn is_command(self) -> bool {
        use TokenKind::*;
        matches!(
            self,
            Include
                | BaseDirectory
                | InJars
                | OutJars
                | LibraryJars
                | KeepDirectories
                | Target
                | DontSkipNonPublicLibraryClasses
                | Keep
                | KeepClassMembers
                | KeepClassesWithMembers
                | KeepNames
                | KeepClassMemberNames
                | KeepClassesWithMemberNames
                | AssumeNoSideEffects
                | AssumeValues
                | WhyAreYouKeeping
                | PrintSeeds
                | PrintUsage
                | PrintMapping
                | PrintConfiguration
                | DontShrink
                | DontOptimize
                | DontObfuscate
                | DontPreverify
                | Optimizations
                | OptimizationPasses
                | AllowAccessModification
                | DontUseMixedCaseClassNames
                | KeepAttributes
                | KeepPackageNames
                | DontWarn
                | Verbose
                | RepackageClasses
                | Command
        )
    }
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
}

impl Token {
    pub fn show(&self) -> &str {
        if self.kind == TokenKind::Eof {
            "<eof>"
        } else {
            &self.text
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LexMode {
    Normal,
    Filepaths,
    Filters,
    Version,
}

fn command_kind(word: &str) -> (TokenKind, LexMode) {
    use LexMode::*;
    use TokenKind::*;
    match word {
        "-include" => (Include, Filepaths),
        "-basedirectory" => (BaseDirectory, Filepaths),
        "-injars" => (InJars, Filepaths),
        "-outjars" => (OutJars, Filepaths),
        "-libraryjars" => (LibraryJars, Filepaths),
        "-keepdirectories" => (KeepDirectories, Filepaths),
        "-printseeds" => (PrintSeeds, Filepaths),
        "-printusage" => (PrintUsage, Filepaths),
        "-printmapping" => (PrintMapping, Filepaths),
        "-printconfiguration" => (PrintConfiguration, Filepaths),
        "-target" => (Target, Version),
        "-optimizations" => (Optimizations, Filters),
        "-keepattributes" => (KeepAttributes, Filters),
        "-keeppackagenames" => (KeepPackageNames, Filters),
        "-dontwarn" => (DontWarn, Filters),
        "-dontskipnonpubliclibraryclasses" => (DontSkipNonPublicLibraryClasses, Normal),
        "-keep" => (Keep, Normal),
        "-keepclassmembers" => (KeepClassMembers, Normal),
        "-keepclasseswithmembers" => (KeepClassesWithMembers, Normal),
        "-keepnames" => (KeepNames, Normal),
        "-keepclassmembernames" => (KeepClassMemberNames, Normal),
        "-keepclasseswithmembernames" => (KeepClassesWithMemberNames, Normal),
        "-assumenosideeffects" => (AssumeNoSideEffects, Normal),
        "-assumevalues" => (AssumeValues, Normal),
        "-whyareyoukeeping" => (WhyAreYouKeeping, Normal),
        "-dontshrink" => (DontShrink, Normal),
        "-dontoptimize" => (DontOptimize, Normal),
        "-dontobfuscate" => (DontObfuscate, Normal),
        "-dontpreverify" => (DontPreverify, Normal),
        "-optimizationpasses" => (OptimizationPasses, Normal),
        "-allowaccessmodification" => (AllowAccessModification, Normal),
        "-dontusemixedcaseclassnames" => (DontUseMixedCaseClassNames, Normal),
        "-verbose" => (Verbose, Normal),
        "-repackageclasses" => (RepackageClasses, Normal),
        _ => (Command, Normal),
    }
}

fn keyword_kind(word: &str) -> TokenKind {
    use TokenKind::*;
    match word {
        "public" => Public,
        "private" => Private,
        "protected" => Protected,
        "static" => Static,
        "final" => Final,
        "abstract" => Abstract,
        "synthetic" => Synthetic,
        "volatile" => Volatile,
        "native" => Native,
        "transient" => Transient,
        "synchronized" => Synchronized,
        "strictfp" => Strictfp,
        "bridge" => Bridge,
        "varargs" => Varargs,
        "class" => Class,
        "interface" => Interface,
        "enum" => Enum,
        "extends" => Extends,
        "implements" => Implements,
        "return" => Returns,
        "includedescriptorclasses" => IncludeDescriptorClasses,
        "allowshrinking" => AllowShrinking,
        "allowoptimization" => AllowOptimization,
        "allowobfuscation" => AllowObfuscation,
        _ => Identifier,
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, '_' | '$' | '.' | '*' | '<' | '>' | '[' | ']' | '%' | '?' | '/' | '-')
}

struct Scanner<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).map(|&b| b as char)
    }

    fn bump(&mut self) {
        if self.input.get(self.pos) == Some(&b'\n') {
            self.line += 1;
        }
        self.pos += 1;
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.bump();
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }
}

/// Scan a configuration source into a token sequence ending in `Eof`.
pub fn lex(input: &str) -> Vec<Token> {
    let mut scanner = Scanner {
        input: input.as_bytes(),
        pos: 0,
        line: 1,
    };
    let mut tokens = Vec::new();
    let mut mode = LexMode::Normal;

    while let Some(c) = scanner.peek() {
        if c.is_whitespace() {
            scanner.bump();
            continue;
        }
        if c == '#' {
            let line = scanner.line;
            let text = scanner.take_while(|c| c != '\n');
            tokens.push(Token {
                kind: TokenKind::Comment,
                text,
                line,
            });
            continue;
        }

        let line = scanner.line;
        match mode {
            LexMode::Filepaths => {
                if c == ',' || c == ':' {
                    scanner.bump();
                    continue;
                }
                if c == '-' {
                    mode = LexMode::Normal;
                    continue;
                }
                let text = scanner.take_while(|c| {
                    !c.is_whitespace() && c != ',' && c != ':' && c != '#'
                });
                tokens.push(Token {
                    kind: TokenKind::Filepath,
                    text,
                    line,
                });
            }
            LexMode::Filters => {
                if c == ',' {
                    scanner.bump();
                    continue;
                }
                if c == '-' {
                    mode = LexMode::Normal;
                    continue;
                }
                let text = scanner.take_while(|c| !c.is_whitespace() && c != ',' && c != '#');
                tokens.push(Token {
                    kind: TokenKind::FilterPattern,
                    text,
                    line,
                });
            }
            LexMode::Version => {
                if c == '-' {
                    mode = LexMode::Normal;
                    continue;
                }
                let text = scanner.take_while(|c| !c.is_whitespace() && c != '#');
                let kind = if !text.is_empty()
                    && text.chars().all(|c| c.is_ascii_digit() || c == '.')
                {
                    TokenKind::TargetVersion
                } else {
                    TokenKind::Unknown
                };
                tokens.push(Token { kind, text, line });
                mode = LexMode::Normal;
            }
            LexMode::Normal => {
                let punct = match c {
                    '{' => Some(TokenKind::OpenCurly),
                    '}' => Some(TokenKind::CloseCurly),
                    '(' => Some(TokenKind::OpenBracket),
                    ')' => Some(TokenKind::CloseBracket),
                    ';' => Some(TokenKind::SemiColon),
                    ':' => Some(TokenKind::Colon),
                    ',' => Some(TokenKind::Comma),
                    '!' => Some(TokenKind::Not),
                    _ => None,
                };
                if let Some(kind) = punct {
                    scanner.bump();
                    tokens.push(Token {
                        kind,
                        text: c.to_string(),
                        line,
                    });
                    continue;
                }
                if c == '@' {
                    scanner.bump();
                    let word = scanner.take_while(is_word_char);
                    if word == "interface" {
                        tokens.push(Token {
                            kind: TokenKind::Annotation,
                            text: "@interface".to_string(),
                            line,
                        });
                    } else {
                        tokens.push(Token {
                            kind: TokenKind::AnnotationApplication,
                            text: "@".to_string(),
                            line,
                        });
                        if !word.is_empty() {
                            tokens.push(Token {
                                kind: keyword_kind(&word),
                                text: word,
                                line,
                            });
                        }
                    }
                    continue;
                }
                if is_word_char(c) {
                    let word = scanner.take_while(is_word_char);
                    if word.starts_with('-') {
                        let (kind, next_mode) = command_kind(&word);
                        mode = next_mode;
                        tokens.push(Token {
                            kind,
                            text: word,
                            line,
                        });
                    } else {
                        tokens.push(Token {
                            kind: keyword_kind(&word),
                            text: word,
                            line,
                        });
                    }
                    continue;
                }
                scanner.bump();
                tokens.push(Token {
                    kind: TokenKind::Unknown,
                    text: c.to_string(),
                    line,
                });
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        text: String::new(),
        line: scanner.line,
    });
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        lex(input).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_keep_rule_with_members() {
        use TokenKind::*;
        assert_eq!(
            kinds("-keep class com.Foo { public <init>(); }"),
            vec![
                Keep, Class, Identifier, OpenCurly, Public, Identifier, OpenBracket,
                CloseBracket, SemiColon, CloseCurly, Eof
            ]
        );
    }

    #[test]
    fn filepath_mode_keeps_paths_whole() {
        let tokens = lex("-injars a/b.jar,c.jar\n-dontshrink");
        let paths: Vec<&Token> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Filepath)
            .collect();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].text, "a/b.jar");
        assert_eq!(paths[1].text, "c.jar");
        assert!(tokens.iter().any(|t| t.kind == TokenKind::DontShrink));
    }

    #[test]
    fn filter_mode_allows_negation_inside_patterns() {
        let tokens = lex("-optimizations !code/simplification/*,code/removal/*");
        let filters: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::FilterPattern)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(filters, vec!["!code/simplification/*", "code/removal/*"]);
    }

    #[test]
    fn target_takes_version_literal() {
        let tokens = lex("-target 1.8");
        assert!(tokens
            .iter()
            .any(|t| t.kind == TokenKind::TargetVersion && t.text == "1.8"));
    }

    #[test]
    fn comments_and_lines_are_tracked() {
        let tokens = lex("# leading comment\n-verbose");
        assert_eq!(tokens[0].kind, TokenKind::Comment);
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].kind, TokenKind::Verbose);
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn annotation_interface_and_application_are_distinct() {
        use TokenKind::*;
        assert_eq!(
            kinds("@interface Anno"),
            vec![Annotation, Identifier, Eof]
        );
        assert_eq!(
            kinds("@com.foo.Anno class *"),
            vec![AnnotationApplication, Identifier, Class, Identifier, Eof]
        );
    }

    #[test]
    fn unknown_input_is_surfaced() {
        let tokens = lex("-keep class \"oops\"");
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Unknown));
    }

    #[test]
    fn unrecognized_directive_becomes_generic_command() {
        let tokens = lex("-dontnote\n-keep class A");
        assert_eq!(tokens[0].kind, TokenKind::Command);
        assert_eq!(tokens[0].text, "-dontnote");
        assert!(tokens[0].kind.is_command());
    }
}
