//! Static scope analysis for implicit variable capture.
//!
//! Given a snippet, [`analyze`] reports which names it reads from the enclosing environment
//! (`referenced`) and which names it binds at module level (`defined`). A host uses this to
//! capture only the variables a snippet needs and to learn which ones it produces.
//!
//! The analysis is deliberately flow-insensitive: names bound in any branch count as defined,
//! and a read counts as a reference only if no enclosing scope has bound the name by the time the
//! walk reaches it.

use std::collections::BTreeSet;

use ahash::AHashSet;
use ruff_python_ast::{
    self as ast, Comprehension, Expr, ExprContext, Parameters, Pattern, Stmt,
    visitor::{self, Visitor},
};
use ruff_python_parser::parse_module;
use ruff_text_size::Ranged;

use crate::error::SyntaxError;

/// Names a snippet reads from and writes to its module namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeAnalysis {
    /// Loaded before any enclosing scope bound them, excluding builtins.
    pub referenced: BTreeSet<String>,
    /// Bound at module level.
    pub defined: BTreeSet<String>,
}

/// Analyzes `source`, treating names for which `is_builtin` returns true as always available.
pub fn analyze(source: &str, is_builtin: impl Fn(&str) -> bool) -> Result<ScopeAnalysis, SyntaxError> {
    let parsed = parse_module(source).map_err(|e| syntax_error(source, &e.to_string(), e.range().start().into()))?;
    let mut walker = ScopeWalker::default();
    walker.visit_body(&parsed.syntax().body);

    let ScopeWalker { referenced, mut scopes } = walker;
    let module = scopes.pop().unwrap_or_default();
    Ok(ScopeAnalysis {
        referenced: referenced.into_iter().filter(|name| !is_builtin(name)).collect(),
        defined: module.names.into_iter().collect(),
    })
}

fn syntax_error(source: &str, message: &str, offset: usize) -> SyntaxError {
    let prefix = source.get(..offset).unwrap_or(source);
    let line_start = prefix.rfind('\n').map_or(0, |index| index + 1);
    SyntaxError {
        message: message.to_owned(),
        line: prefix.matches('\n').count() + 1,
        column: prefix[line_start..].chars().count() + 1,
    }
}

#[derive(Default)]
struct Scope {
    names: AHashSet<String>,
    comprehension: bool,
}

struct ScopeWalker {
    referenced: AHashSet<String>,
    /// Innermost last; the first entry is the module scope.
    scopes: Vec<Scope>,
}

impl Default for ScopeWalker {
    fn default() -> Self {
        Self {
            referenced: AHashSet::new(),
            scopes: vec![Scope::default()],
        }
    }
}

impl ScopeWalker {
    fn define(&mut self, name: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.names.insert(name.to_owned());
        }
    }

    /// Binds in the nearest scope that is not a comprehension, as `:=` does.
    fn define_outside_comprehensions(&mut self, name: &str) {
        if let Some(scope) = self.scopes.iter_mut().rev().find(|scope| !scope.comprehension) {
            scope.names.insert(name.to_owned());
        }
    }

    fn reference(&mut self, name: &str) {
        if !self.scopes.iter().any(|scope| scope.names.contains(name)) {
            self.referenced.insert(name.to_owned());
        }
    }

    fn with_scope(&mut self, comprehension: bool, f: impl FnOnce(&mut Self)) {
        self.scopes.push(Scope {
            names: AHashSet::new(),
            comprehension,
        });
        f(self);
        self.scopes.pop();
    }

    fn visit_comprehension_scope<'a>(&mut self, generators: &'a [Comprehension], elements: &[&'a Expr]) {
        self.with_scope(true, |walker| {
            for generator in generators {
                walker.visit_comprehension(generator);
            }
            for &element in elements {
                walker.visit_expr(element);
            }
        });
    }
}

impl<'a> Visitor<'a> for ScopeWalker {
    fn visit_stmt(&mut self, stmt: &'a Stmt) {
        match stmt {
            Stmt::FunctionDef(ast::StmtFunctionDef {
                name,
                decorator_list,
                type_params,
                parameters,
                returns,
                body,
                ..
            }) => {
                for decorator in decorator_list {
                    self.visit_decorator(decorator);
                }
                self.define(name.id.as_str());
                self.with_scope(false, |walker| {
                    if let Some(type_params) = type_params {
                        walker.visit_type_params(type_params);
                    }
                    walker.visit_parameters(parameters);
                    if let Some(returns) = returns {
                        walker.visit_annotation(returns);
                    }
                    walker.visit_body(body);
                });
            }
            Stmt::ClassDef(ast::StmtClassDef {
                name,
                decorator_list,
                type_params,
                arguments,
                body,
                ..
            }) => {
                for decorator in decorator_list {
                    self.visit_decorator(decorator);
                }
                if let Some(arguments) = arguments {
                    self.visit_arguments(arguments);
                }
                self.define(name.id.as_str());
                self.with_scope(false, |walker| {
                    if let Some(type_params) = type_params {
                        walker.visit_type_params(type_params);
                    }
                    walker.visit_body(body);
                });
            }
            Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                self.visit_expr(value);
                for target in targets {
                    self.visit_expr(target);
                }
            }
            Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
                self.visit_expr(value);
                if let Expr::Name(ast::ExprName { id, .. }) = target.as_ref() {
                    self.reference(id.as_str());
                }
                self.visit_expr(target);
            }
            Stmt::AnnAssign(ast::StmtAnnAssign {
                target,
                annotation,
                value,
                ..
            }) => {
                if let Some(value) = value {
                    self.visit_expr(value);
                }
                self.visit_annotation(annotation);
                self.visit_expr(target);
            }
            Stmt::Import(ast::StmtImport { names, .. }) => {
                for alias in names {
                    let bound = match &alias.asname {
                        Some(asname) => asname.id.as_str(),
                        None => alias.name.id.as_str().split('.').next().unwrap_or_default(),
                    };
                    self.define(bound);
                }
            }
            Stmt::ImportFrom(ast::StmtImportFrom { names, .. }) => {
                for alias in names {
                    let bound = alias.asname.as_ref().unwrap_or(&alias.name).id.as_str();
                    if bound != "*" {
                        self.define(bound);
                    }
                }
            }
            _ => visitor::walk_stmt(self, stmt),
        }
    }

    fn visit_expr(&mut self, expr: &'a Expr) {
        match expr {
            Expr::Name(ast::ExprName { id, ctx, .. }) => match ctx {
                ExprContext::Store => self.define(id.as_str()),
                ExprContext::Load => self.reference(id.as_str()),
                _ => {}
            },
            Expr::Named(ast::ExprNamed { target, value, .. }) => {
                self.visit_expr(value);
                if let Expr::Name(ast::ExprName { id, .. }) = target.as_ref() {
                    self.define_outside_comprehensions(id.as_str());
                } else {
                    self.visit_expr(target);
                }
            }
            Expr::Lambda(ast::ExprLambda { parameters, body, .. }) => {
                self.with_scope(false, |walker| {
                    if let Some(parameters) = parameters {
                        walker.visit_parameters(parameters);
                    }
                    walker.visit_expr(body);
                });
            }
            Expr::ListComp(ast::ExprListComp { elt, generators, .. })
            | Expr::SetComp(ast::ExprSetComp { elt, generators, .. })
            | Expr::Generator(ast::ExprGenerator { elt, generators, .. }) => {
                self.visit_comprehension_scope(generators, &[&**elt]);
            }
            Expr::DictComp(ast::ExprDictComp {
                key, value, generators, ..
            }) => {
                let elements: Vec<&Expr> = key.as_deref().into_iter().chain([&**value]).collect();
                self.visit_comprehension_scope(generators, &elements);
            }
            _ => visitor::walk_expr(self, expr),
        }
    }

    fn visit_comprehension(&mut self, comprehension: &'a Comprehension) {
        self.visit_expr(&comprehension.iter);
        self.visit_expr(&comprehension.target);
        for condition in &comprehension.ifs {
            self.visit_expr(condition);
        }
    }

    fn visit_parameters(&mut self, parameters: &'a Parameters) {
        let with_defaults = || {
            parameters
                .posonlyargs
                .iter()
                .chain(&parameters.args)
                .chain(&parameters.kwonlyargs)
        };
        for parameter in with_defaults() {
            if let Some(default) = &parameter.default {
                self.visit_expr(default);
            }
            if let Some(annotation) = &parameter.parameter.annotation {
                self.visit_annotation(annotation);
            }
        }
        for parameter in parameters.vararg.iter().chain(&parameters.kwarg) {
            if let Some(annotation) = &parameter.annotation {
                self.visit_annotation(annotation);
            }
        }
        for parameter in with_defaults() {
            self.define(parameter.parameter.name.id.as_str());
        }
        for parameter in parameters.vararg.iter().chain(&parameters.kwarg) {
            self.define(parameter.name.id.as_str());
        }
    }

    fn visit_pattern(&mut self, pattern: &'a Pattern) {
        match pattern {
            Pattern::MatchAs(ast::PatternMatchAs { pattern, name, .. }) => {
                if let Some(pattern) = pattern {
                    self.visit_pattern(pattern);
                }
                if let Some(name) = name {
                    self.define(name.id.as_str());
                }
            }
            Pattern::MatchStar(ast::PatternMatchStar { name, .. }) => {
                if let Some(name) = name {
                    self.define(name.id.as_str());
                }
            }
            Pattern::MatchMapping(ast::PatternMatchMapping { keys, patterns, rest, .. }) => {
                for key in keys {
                    self.visit_expr(key);
                }
                for pattern in patterns {
                    self.visit_pattern(pattern);
                }
                if let Some(rest) = rest {
                    self.define(rest.id.as_str());
                }
            }
            _ => visitor::walk_pattern(self, pattern),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn builtin(name: &str) -> bool {
        matches!(name, "print" | "len" | "range" | "sum" | "int" | "str" | "isinstance")
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|&s| s.to_owned()).collect()
    }

    fn check(source: &str, referenced: &[&str], defined: &[&str]) {
        let analysis = analyze(source, builtin).unwrap();
        assert_eq!(analysis.referenced, names(referenced), "referenced names of {source:?}");
        assert_eq!(analysis.defined, names(defined), "defined names of {source:?}");
    }

    #[test]
    fn assignment_reads_before_it_binds() {
        check("x = y + 1\nz = x", &["y"], &["x", "z"]);
        check("x = x + 1", &["x"], &["x"]);
    }

    #[test]
    fn augmented_assignment_references_its_target() {
        check("total += 1", &["total"], &["total"]);
    }

    #[test]
    fn branches_over_approximate_definitions() {
        check("if True:\n    x = 1\nelse:\n    y = 2\n", &[], &["x", "y"]);
        check("for i in items:\n    last = i\n", &["items"], &["i", "last"]);
    }

    #[test]
    fn functions_bind_their_name_and_hide_parameters() {
        check(
            "def f(a, b=default, *args, c, **kw):\n    return a + b + c + outer\n",
            &["default", "outer"],
            &["f"],
        );
    }

    #[test]
    fn defaults_are_scanned_before_parameters_exist() {
        check("def f(a, b=a):\n    pass\n", &["a"], &["f"]);
    }

    #[test]
    fn lambdas_introduce_a_scope() {
        check("g = lambda x: x + y", &["y"], &["g"]);
    }

    #[test]
    fn classes_bind_their_name_and_scan_bases_outside() {
        check(
            "class C(Base):\n    attr = 1\n    def method(self):\n        return attr\n",
            &["Base"],
            &["C"],
        );
    }

    #[test]
    fn comprehension_variables_do_not_leak() {
        check("result = [x * 2 for x in data if x > limit]", &["data", "limit"], &["result"]);
        check("d = {k: v for k, v in pairs}", &["pairs"], &["d"]);
        check("s = sum(i for i in range(10))", &[], &["s"]);
    }

    #[test]
    fn walrus_in_comprehension_binds_outside() {
        check("values = [y := f(x) for x in data]", &["f", "data"], &["values", "y"]);
        check("if (n := len(items)) > 3:\n    print(n)\n", &["items"], &["n"]);
    }

    #[test]
    fn imports_define_bound_names() {
        check(
            "import os.path\nimport numpy as np\nfrom collections import OrderedDict, deque as dq\nfrom m import *\n",
            &[],
            &["os", "np", "OrderedDict", "dq"],
        );
    }

    #[test]
    fn match_captures_define_names() {
        check(
            "match command:\n    case [first, *rest]:\n        pass\n    case {'k': v, **others}:\n        pass\n    case Point(x=px) as point:\n        pass\n    case other:\n        pass\n",
            &["command", "Point"],
            &["first", "rest", "v", "others", "px", "point", "other"],
        );
    }

    #[test]
    fn builtins_are_not_referenced() {
        check("print(len(data))", &["data"], &[]);
    }

    #[test]
    fn empty_source_has_no_names() {
        assert_eq!(analyze("", builtin).unwrap(), ScopeAnalysis::default());
    }

    #[test]
    fn syntax_errors_report_a_position() {
        let err = analyze("x = 1\ny = (\n", builtin).unwrap_err();
        assert!(err.line >= 2, "unexpected error position: {err}");
    }
}
