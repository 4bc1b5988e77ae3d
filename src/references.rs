//! Candidate type-name collection for one class.
//!
//! This is a lexical heuristic, not a type checker. It over-collects on
//! purpose: keywords, framework types and false positives are dropped later
//! by the closure resolver, while a missed custom type silently degrades the
//! generated test.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::extractor::ClassUnit;

static TYPE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z]\w*(?:<[^>]+>)?").expect("type token regex"));
static GENERIC_ARGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^>]+)>").expect("generic argument regex"));
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_]\w*").expect("identifier regex"));

/// Parameter modifiers that precede the declared type.
const PARAMETER_MODIFIERS: [&str; 6] = ["ref", "out", "in", "params", "this", "scoped"];

/// Union of the primary method's declared dependency types, the type-like
/// tokens in its body, and the declared types of constructor parameters.
pub fn collect_references(class: &ClassUnit) -> BTreeSet<String> {
    let mut names = BTreeSet::new();

    for dep in class.declared_dependencies() {
        let dep = dep.trim();
        if !dep.is_empty() {
            names.insert(dep.to_string());
        }
    }
    if let Some(method) = class.primary_method() {
        collect_type_tokens(&method.source_code, &mut names);
    }

    for ctor in &class.constructors {
        for param in &ctor.parameters {
            collect_parameter_type(param, &mut names);
        }
    }

    names
}

/// Adds every capitalised identifier in `text`, decomposing a directly
/// following `<...>` argument list one level deep.
pub fn collect_type_tokens(text: &str, names: &mut BTreeSet<String>) {
    for token in TYPE_TOKEN.find_iter(text) {
        let token = token.as_str();
        let base = token.split('<').next().unwrap_or(token);
        names.insert(base.to_string());

        for args in GENERIC_ARGS.captures_iter(token) {
            for arg in args[1].split(',') {
                add_generic_argument(arg.trim(), names);
            }
        }
    }
}

fn add_generic_argument(arg: &str, names: &mut BTreeSet<String>) {
    if arg.is_empty() {
        return;
    }
    names.insert(arg.to_string());
    // `List<Order` from an unbalanced capture still has to yield `Order`.
    if arg.contains(|c: char| !(c.is_alphanumeric() || c == '_')) {
        for ident in IDENTIFIER.find_iter(arg) {
            names.insert(ident.as_str().to_string());
        }
    }
}

fn collect_parameter_type(param: &str, names: &mut BTreeSet<String>) {
    let mut tokens = param.split_whitespace();
    let Some(first) = tokens.next() else {
        return;
    };
    names.insert(first.to_string());

    let declared = if PARAMETER_MODIFIERS.contains(&first) || first.starts_with('[') {
        tokens.next()
    } else {
        Some(first)
    };
    if let Some(declared) = declared {
        names.insert(declared.to_string());
        collect_type_tokens(declared, names);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{ConstructorInfo, MethodInfo};

    fn class_with(method_source: &str, deps: &[&str], ctor_params: &[&str]) -> ClassUnit {
        ClassUnit {
            class_name: "Order".to_string(),
            methods: vec![MethodInfo {
                name: "Submit".to_string(),
                source_code: method_source.to_string(),
                dependency_types: deps.iter().map(|d| d.to_string()).collect(),
                ..MethodInfo::default()
            }],
            constructors: vec![ConstructorInfo {
                parameters: ctor_params.iter().map(|p| p.to_string()).collect(),
                ..ConstructorInfo::default()
            }],
            ..ClassUnit::default()
        }
    }

    #[test]
    fn constructor_parameter_types_are_collected() {
        let order = class_with("", &[], &["Customer customer"]);
        let refs = collect_references(&order);
        assert!(refs.contains("Customer"));
    }

    #[test]
    fn method_body_tokens_and_generic_arguments_are_collected() {
        let order = class_with(
            "public ShippingLabel Ship(Dictionary<string, Parcel> parcels) { var r = new Result<Receipt>(); }",
            &["Shop.Warehouse"],
            &[],
        );
        let refs = collect_references(&order);
        for expected in [
            "ShippingLabel",
            "Ship",
            "Dictionary",
            "string",
            "Parcel",
            "Result",
            "Receipt",
            "Shop.Warehouse",
        ] {
            assert!(refs.contains(expected), "missing {expected}: {refs:?}");
        }
    }

    #[test]
    fn nested_generics_still_yield_inner_type() {
        let mut names = BTreeSet::new();
        collect_type_tokens("Task<List<OrderLine>> Load()", &mut names);
        assert!(names.contains("Task"));
        assert!(names.contains("OrderLine"));
        assert!(names.contains("List"));
    }

    #[test]
    fn parameter_modifiers_and_attributes_do_not_hide_the_type() {
        let order = class_with(
            "",
            &[],
            &["[FromServices] IClock clock", "ref Money total", "IEnumerable<Coupon> coupons"],
        );
        let refs = collect_references(&order);
        assert!(refs.contains("IClock"));
        assert!(refs.contains("Money"));
        assert!(refs.contains("IEnumerable<Coupon>"));
        assert!(refs.contains("Coupon"));
    }

    #[test]
    fn class_without_methods_uses_constructors_only() {
        let mut order = class_with("", &[], &["Customer customer"]);
        order.methods.clear();
        let refs = collect_references(&order);
        assert_eq!(refs.into_iter().collect::<Vec<_>>(), vec!["Customer".to_string()]);
    }

    #[test]
    fn lowercase_identifiers_are_not_type_candidates() {
        let mut names = BTreeSet::new();
        collect_type_tokens("var total = items.sum(x => x.price);", &mut names);
        assert!(names.is_empty(), "{names:?}");
    }
}
