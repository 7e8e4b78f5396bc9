//! Automatic table naming.

use std::sync::Arc;

use crate::declarative::ModelDeclaration;

/// Convert a CamelCase model name to snake_case.
///
/// An underscore goes before an uppercase letter that follows a lowercase
/// letter or digit, and before an uppercase letter (not the first) that is
/// followed by a lowercase letter, so acronyms stay together.
pub fn camel_to_snake(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut result = String::with_capacity(name.len() + 4);

    for (i, &ch) in chars.iter().enumerate() {
        if ch.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).map(|c| c.is_lowercase()).unwrap_or(false);
            if prev.is_lowercase() || prev.is_ascii_digit() || (next_is_lower && prev != '_') {
                result.push('_');
            }
        }
        result.extend(ch.to_lowercase());
    }

    result
}

/// Decide whether `cls` needs a generated table name.
///
/// `concrete` is the merged `concrete` mapper option of the class.
pub fn should_generate_tablename(cls: &ModelDeclaration, concrete: bool) -> bool {
    if cls.tablename.is_some() || cls.table.is_some() || cls.is_abstract() {
        return false;
    }

    if cls.declares_primary_key(cls) {
        return true;
    }

    for base in &cls.bases {
        let lineage = lineage(base);
        if !concrete && lineage.iter().any(|decl| decl.provides_table()) {
            return false;
        }
        if lineage.iter().any(|decl| decl.declares_primary_key(cls)) {
            return true;
        }
    }

    false
}

/// `decl` and every declaration it inherits from, depth first.
fn lineage(decl: &Arc<ModelDeclaration>) -> Vec<&ModelDeclaration> {
    let mut out: Vec<&ModelDeclaration> = Vec::new();
    let mut stack: Vec<&Arc<ModelDeclaration>> = vec![decl];
    while let Some(current) = stack.pop() {
        if out.iter().any(|seen| std::ptr::eq(*seen, current.as_ref())) {
            continue;
        }
        out.push(current.as_ref());
        stack.extend(current.bases.iter().rev());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative::ModelBuilder;
    use crate::schema::{Column, ColumnDecl};

    #[test]
    fn test_camel_to_snake() {
        assert_eq!(camel_to_snake("UserAccount"), "user_account");
        assert_eq!(camel_to_snake("Foo"), "foo");
        assert_eq!(camel_to_snake("HTTPResponse"), "http_response");
        assert_eq!(camel_to_snake("AutoGenTableName"), "auto_gen_table_name");
        assert_eq!(camel_to_snake("Order2Item"), "order2_item");
        assert_eq!(camel_to_snake("already_snake"), "already_snake");
    }

    #[test]
    fn test_generates_for_own_primary_key() {
        let cls = ModelBuilder::model("UserAccount")
            .column(Column::integer("id").primary_key())
            .declare();
        assert!(should_generate_tablename(&cls, false));
    }

    #[test]
    fn test_explicit_tablename_and_abstract_skip() {
        let cls = ModelBuilder::model("UserAccount")
            .tablename("accounts")
            .column(Column::integer("id").primary_key())
            .declare();
        assert!(!should_generate_tablename(&cls, false));

        let cls = ModelBuilder::abstract_model("Base")
            .column(Column::integer("id").primary_key())
            .declare();
        assert!(!should_generate_tablename(&cls, false));
    }

    #[test]
    fn test_declared_primary_key_is_evaluated() {
        let cls = ModelBuilder::model("Widget")
            .column(ColumnDecl::declared(|_| Column::integer("id").primary_key()))
            .declare();
        assert!(should_generate_tablename(&cls, false));
    }

    #[test]
    fn test_primary_key_from_mixin() {
        let mixin = ModelBuilder::mixin("IdMixin")
            .column(Column::integer("id").primary_key())
            .declare();
        let cls = ModelBuilder::model("Gadget").base(&mixin).declare();
        assert!(should_generate_tablename(&cls, false));
    }

    #[test]
    fn test_subclass_of_mapped_model() {
        let parent = ModelBuilder::model("Parent")
            .tablename("parent")
            .column(Column::integer("id").primary_key())
            .declare();
        let child = ModelBuilder::model("Child").base(&parent).declare();

        assert!(!should_generate_tablename(&child, false));
        assert!(should_generate_tablename(&child, true));
    }

    #[test]
    fn test_no_primary_key_anywhere() {
        let cls = ModelBuilder::model("Loose").column(Column::string("name")).declare();
        assert!(!should_generate_tablename(&cls, false));
    }
}
