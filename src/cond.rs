//! Presence conditions.
//!
//! Every token the preprocessor emits carries the boolean condition under
//! which it survives conditional compilation: the conjunction of every
//! enclosing `#if`/`#elif`/`#else` branch, with `#else` and later `#elif`s
//! carrying the negations of their earlier siblings.
//!
//! Formulas are stored in an arena of nodes referenced by `CondId` and
//! hash-consed, so deeply nested conditional code shares structure instead
//! of allocating a fresh tree per token. The arena is owned by a single
//! engine instance; independent engines share nothing.

use std::collections::HashMap;
use std::fmt;

use crate::intern::InternedStr;

/// An index into a [`CondArena`].
///
/// Because nodes are interned, two `CondId`s from the same arena are equal
/// exactly when their formulas are structurally identical.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CondId(u32);

/// One node of a presence-condition formula.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Cond {
    True,
    False,
    /// "macro M is defined"
    Defined(InternedStr),
    /// "this `#if` expression evaluates to a nonzero integer".
    /// The expression is kept as normalized source text; the engine does
    /// not reason about it beyond identity.
    Expr(InternedStr),
    Not(CondId),
    And(CondId, CondId),
    Or(CondId, CondId),
}

#[derive(Debug)]
pub struct CondArena {
    nodes: Vec<Cond>,
    interned: HashMap<Cond, CondId>,
}

impl Default for CondArena {
    fn default() -> Self {
        Self::new()
    }
}

impl CondArena {
    pub fn new() -> CondArena {
        let mut arena = CondArena {
            nodes: Vec::new(),
            interned: HashMap::new(),
        };
        // slots 0 and 1, so `tt()`/`ff()` never allocate
        arena.intern(Cond::True);
        arena.intern(Cond::False);
        arena
    }

    fn intern(&mut self, node: Cond) -> CondId {
        if let Some(&id) = self.interned.get(&node) {
            return id;
        }
        let id = CondId(self.nodes.len() as u32);
        self.nodes.push(node.clone());
        self.interned.insert(node, id);
        id
    }

    pub fn get(&self, id: CondId) -> &Cond {
        &self.nodes[id.0 as usize]
    }

    pub fn tt(&mut self) -> CondId {
        self.intern(Cond::True)
    }

    pub fn ff(&mut self) -> CondId {
        self.intern(Cond::False)
    }

    pub fn defined(&mut self, name: InternedStr) -> CondId {
        self.intern(Cond::Defined(name))
    }

    pub fn expr(&mut self, text: InternedStr) -> CondId {
        self.intern(Cond::Expr(text))
    }

    pub fn not(&mut self, id: CondId) -> CondId {
        match *self.get(id) {
            Cond::True => self.ff(),
            Cond::False => self.tt(),
            Cond::Not(inner) => inner,
            _ => self.intern(Cond::Not(id)),
        }
    }

    pub fn and(&mut self, left: CondId, right: CondId) -> CondId {
        let tt = self.tt();
        let ff = self.ff();
        if left == tt || left == right {
            return right;
        }
        if right == tt {
            return left;
        }
        if left == ff || right == ff {
            return ff;
        }
        self.intern(Cond::And(left, right))
    }

    pub fn or(&mut self, left: CondId, right: CondId) -> CondId {
        let tt = self.tt();
        let ff = self.ff();
        if left == ff || left == right {
            return right;
        }
        if right == ff {
            return left;
        }
        if left == tt || right == tt {
            return tt;
        }
        self.intern(Cond::Or(left, right))
    }

    /// Evaluate a formula under a concrete configuration.
    ///
    /// `defined` decides "is macro M defined"; `expr` decides the truth of
    /// opaque expression atoms. Used to check (un)satisfiability of emitted
    /// conditions against a macro environment.
    pub fn eval<D, E>(&self, id: CondId, defined: &D, expr: &E) -> bool
    where
        D: Fn(InternedStr) -> bool,
        E: Fn(InternedStr) -> bool,
    {
        match *self.get(id) {
            Cond::True => true,
            Cond::False => false,
            Cond::Defined(name) => defined(name),
            Cond::Expr(text) => expr(text),
            Cond::Not(inner) => !self.eval(inner, defined, expr),
            Cond::And(l, r) => self.eval(l, defined, expr) && self.eval(r, defined, expr),
            Cond::Or(l, r) => self.eval(l, defined, expr) || self.eval(r, defined, expr),
        }
    }

    pub fn display(&self, id: CondId) -> DisplayCond<'_> {
        DisplayCond { arena: self, id }
    }
}

/// Renders a formula as C-ish syntax: `defined(A) && !defined(B)`.
pub struct DisplayCond<'a> {
    arena: &'a CondArena,
    id: CondId,
}

// binding strength, loosest first: Or, And, everything else
fn precedence(cond: &Cond) -> u8 {
    match cond {
        Cond::Or(..) => 1,
        Cond::And(..) => 2,
        _ => 3,
    }
}

impl DisplayCond<'_> {
    fn fmt_node(&self, f: &mut fmt::Formatter, id: CondId, min_prec: u8) -> fmt::Result {
        let node = self.arena.get(id);
        let prec = precedence(node);
        let parens = prec < min_prec;
        if parens {
            write!(f, "(")?;
        }
        match *node {
            Cond::True => write!(f, "1")?,
            Cond::False => write!(f, "0")?,
            Cond::Defined(name) => write!(f, "defined({})", name)?,
            Cond::Expr(text) => write!(f, "({})", text)?,
            Cond::Not(inner) => {
                write!(f, "!")?;
                self.fmt_node(f, inner, 3)?;
            }
            Cond::And(l, r) => {
                self.fmt_node(f, l, 2)?;
                write!(f, " && ")?;
                self.fmt_node(f, r, 2)?;
            }
            Cond::Or(l, r) => {
                self.fmt_node(f, l, 1)?;
                write!(f, " || ")?;
                self.fmt_node(f, r, 1)?;
            }
        }
        if parens {
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl fmt::Display for DisplayCond<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_node(f, self.id, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(arena: &mut CondArena, names: &[&str]) -> Vec<CondId> {
        names.iter().map(|n| arena.defined((*n).into())).collect()
    }

    #[test]
    fn constants_fold() {
        let mut arena = CondArena::new();
        let (tt, ff) = (arena.tt(), arena.ff());
        let a = arena.defined("A".into());
        assert_eq!(arena.and(tt, a), a);
        assert_eq!(arena.and(a, tt), a);
        assert_eq!(arena.and(ff, a), ff);
        assert_eq!(arena.or(ff, a), a);
        assert_eq!(arena.or(a, tt), tt);
        assert_eq!(arena.not(tt), ff);
        let not_a = arena.not(a);
        assert_eq!(arena.not(not_a), a);
    }

    #[test]
    fn interning_shares_structure() {
        let mut arena = CondArena::new();
        let ids = names(&mut arena, &["A", "B", "A"]);
        assert_eq!(ids[0], ids[2]);
        assert_ne!(ids[0], ids[1]);
        let and1 = arena.and(ids[0], ids[1]);
        let and2 = arena.and(ids[2], ids[1]);
        assert_eq!(and1, and2);
    }

    #[test]
    fn eval_under_environment() {
        let mut arena = CondArena::new();
        let a = arena.defined("A".into());
        let b = arena.defined("B".into());
        let not_b = arena.not(b);
        let both = arena.and(a, not_b);
        let defined = |name: crate::InternedStr| name == "A".into();
        assert!(arena.eval(both, &defined, &|_| false));
        let neither = |_: crate::InternedStr| false;
        assert!(!arena.eval(both, &neither, &|_| false));
    }

    #[test]
    fn display_uses_c_syntax() {
        let mut arena = CondArena::new();
        let a = arena.defined("A".into());
        let b = arena.defined("B".into());
        let c = arena.defined("C".into());
        let not_b = arena.not(b);
        let and = arena.and(a, not_b);
        let or = arena.or(and, c);
        assert_eq!(
            arena.display(or).to_string(),
            "defined(A) && !defined(B) || defined(C)"
        );
        let and_of_or = arena.and(or, a);
        assert_eq!(
            arena.display(and_of_or).to_string(),
            "(defined(A) && !defined(B) || defined(C)) && defined(A)"
        );
    }
}
