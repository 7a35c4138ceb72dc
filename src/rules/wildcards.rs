//! Shrinker type pattern to JVM descriptor translation.

/// Convert a keep-rule type pattern into JVM descriptor form, preserving
/// shrinker wildcards. `java.lang.String` becomes `Ljava/lang/String;`,
/// `**` becomes `L**;`, `%` (any primitive) and `***` (any type) pass
/// through, and trailing `[]` pairs become leading array dimensions.
pub fn convert_wildcard_type(pattern: &str) -> String {
    let mut base = pattern;
    let mut dims = 0;
    while let Some(stripped) = base.strip_suffix("[]") {
        base = stripped;
        dims += 1;
    }

    let desc = match base {
        "void" => "V".to_string(),
        "boolean" => "Z".to_string(),
        "byte" => "B".to_string(),
        "char" => "C".to_string(),
        "short" => "S".to_string(),
        "int" => "I".to_string(),
        "long" => "J".to_string(),
        "float" => "F".to_string(),
        "double" => "D".to_string(),
        "%" => "%".to_string(),
        "***" => "***".to_string(),
        _ => format!("L{};", base.replace('.', "/")),
    };

    let mut out = String::with_capacity(dims + desc.len());
    for _ in 0..dims {
        out.push('[');
    }
    out.push_str(&desc);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_types_use_internal_form() {
        assert_eq!(convert_wildcard_type("java.lang.String"), "Ljava/lang/String;");
        assert_eq!(convert_wildcard_type("com.foo.Bar$Inner"), "Lcom/foo/Bar$Inner;");
    }

    #[test]
    fn primitives_map_to_single_letters() {
        assert_eq!(convert_wildcard_type("void"), "V");
        assert_eq!(convert_wildcard_type("int"), "I");
        assert_eq!(convert_wildcard_type("boolean"), "Z");
    }

    #[test]
    fn wildcards_survive_translation() {
        assert_eq!(convert_wildcard_type("**"), "L**;");
        assert_eq!(convert_wildcard_type("%"), "%");
        assert_eq!(convert_wildcard_type("***"), "***");
    }

    #[test]
    fn arrays_become_leading_dimensions() {
        assert_eq!(convert_wildcard_type("int[]"), "[I");
        assert_eq!(convert_wildcard_type("java.lang.String[][]"), "[[Ljava/lang/String;");
    }
}
