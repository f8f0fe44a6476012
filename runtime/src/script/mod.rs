//! Statement model for the agent's scripting protocol.
//!
//! Every message on the command channel is one complete statement in the
//! agent's (Python) syntax. Statements are built from a small expression
//! tree instead of format strings so the sequencer can see which remote
//! objects a statement creates and which ones it references.

mod literal;

pub use literal::{format_float, parse_float_literal, quote_string, Literal};

use opennet_core::error::{NetError, Result};

/// Name under which the agent exposes the client socket to statements.
pub const REPLY_SOCKET: &str = "csock";

/// Truthy reply sentinel.
pub const TRUE_SENTINEL: &[u8] = b"True";

/// Falsy reply sentinel.
pub const FALSE_SENTINEL: &[u8] = b"False";

/// An expression in a statement
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Literal),
    /// A remote object created by an earlier statement of this session
    Var(String),
    /// A name provided by the simulator bindings (type, constant, function)
    Global(String),
    /// Call of a simulator-provided callable, e.g. `StringValue ("x")`
    Call { callee: String, args: Vec<Expr> },
    /// Method call on an expression, e.g. `lteHelper.Install (n)`
    Method {
        target: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    /// Subscript, e.g. `tapBridges[3]`
    Index { target: Box<Expr>, index: i64 },
    /// Keyword argument, e.g. `target = run`
    Keyword { name: String, value: Box<Expr> },
    /// List display, e.g. `[]`
    List(Vec<Expr>),
}

impl Expr {
    pub fn method(self, method: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Method {
            target: Box::new(self),
            method: method.into(),
            args,
        }
    }

    pub fn index(self, index: i64) -> Expr {
        Expr::Index {
            target: Box::new(self),
            index,
        }
    }

    pub fn render(&self) -> Result<String> {
        match self {
            Expr::Lit(lit) => lit.render(),
            Expr::Var(name) => {
                check_identifier(name)?;
                Ok(name.clone())
            }
            Expr::Global(path) => {
                check_path(path)?;
                Ok(path.clone())
            }
            Expr::Call { callee, args } => {
                check_path(callee)?;
                Ok(format!("{} ({})", callee, render_args(args)?))
            }
            Expr::Method {
                target,
                method,
                args,
            } => {
                check_identifier(method)?;
                Ok(format!("{}.{} ({})", target.render()?, method, render_args(args)?))
            }
            Expr::Index { target, index } => Ok(format!("{}[{}]", target.render()?, index)),
            Expr::Keyword { name, value } => {
                check_identifier(name)?;
                Ok(format!("{} = {}", name, value.render()?))
            }
            Expr::List(items) => Ok(format!("[{}]", render_args(items)?)),
        }
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Var(name) => out.push(name),
            Expr::Lit(_) | Expr::Global(_) => {}
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_references(out)),
            Expr::Method { target, args, .. } => {
                target.collect_references(out);
                args.iter().for_each(|a| a.collect_references(out));
            }
            Expr::Index { target, .. } => target.collect_references(out),
            Expr::Keyword { value, .. } => value.collect_references(out),
            Expr::List(items) => items.iter().for_each(|a| a.collect_references(out)),
        }
    }
}

fn render_args(args: &[Expr]) -> Result<String> {
    let rendered = args.iter().map(Expr::render).collect::<Result<Vec<_>>>()?;
    Ok(rendered.join(", "))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(s: &str) -> Result<()> {
    if is_identifier(s) {
        Ok(())
    } else {
        Err(NetError::InvalidParameter(format!("'{}' is not an identifier", s)))
    }
}

fn check_path(s: &str) -> Result<()> {
    if !s.is_empty() && s.split('.').all(is_identifier) {
        Ok(())
    } else {
        Err(NetError::InvalidParameter(format!("'{}' is not a dotted name", s)))
    }
}

/// One protocol statement
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `target = value`
    Assign { target: String, value: Expr },
    /// `target.field = value`
    SetField {
        target: String,
        field: String,
        value: Expr,
    },
    /// Bare expression evaluated for its side effect
    Eval(Expr),
    /// `def name ():` with an indented body
    Def { name: String, body: Vec<Statement> },
    /// Boolean query answered with a sentinel on the reply socket
    Query { condition: Expr },
}

impl Statement {
    pub fn assign(target: impl Into<String>, value: Expr) -> Self {
        Statement::Assign {
            target: target.into(),
            value,
        }
    }

    pub fn set_field(target: impl Into<String>, field: impl Into<String>, value: Expr) -> Self {
        Statement::SetField {
            target: target.into(),
            field: field.into(),
            value,
        }
    }

    pub fn eval(expr: Expr) -> Self {
        Statement::Eval(expr)
    }

    pub fn def(name: impl Into<String>, body: Vec<Statement>) -> Self {
        Statement::Def {
            name: name.into(),
            body,
        }
    }

    pub fn query(condition: Expr) -> Self {
        Statement::Query { condition }
    }

    /// Remote object this statement creates (or rebinds), if any.
    pub fn defines(&self) -> Option<&str> {
        match self {
            Statement::Assign { target, .. } | Statement::Def { name: target, .. } => Some(target),
            _ => None,
        }
    }

    /// Remote objects this statement requires to exist already.
    ///
    /// For an assignment the right-hand side is evaluated before the name
    /// is bound, so `x = f (x)` references the previous `x`.
    pub fn references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        match self {
            Statement::Assign { value, .. } => value.collect_references(&mut out),
            Statement::SetField { target, value, .. } => {
                out.push(target.as_str());
                value.collect_references(&mut out);
            }
            Statement::Eval(expr) => expr.collect_references(&mut out),
            Statement::Def { body, .. } => {
                for stmt in body {
                    out.extend(stmt.references());
                }
            }
            Statement::Query { condition } => {
                condition.collect_references(&mut out);
                out.push(REPLY_SOCKET);
            }
        }
        out
    }

    /// Whether the agent answers this statement on the reply socket.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Statement::Query { .. })
    }

    /// Newline-terminated wire text.
    pub fn render(&self) -> Result<String> {
        let mut out = String::new();
        self.render_into(&mut out, 0)?;
        Ok(out)
    }

    /// Wire text for a query tagged with a request sequence number. The
    /// tag is a trailing comment, so the interpreter ignores it.
    pub fn render_tagged(&self, seq: u64) -> Result<String> {
        match self {
            Statement::Query { condition } => Ok(format!(
                "if {}:  # seq {}\n    {}.sendall (\"True\")\nelse:\n    {}.sendall (\"False\")\n",
                condition.render()?,
                seq,
                REPLY_SOCKET,
                REPLY_SOCKET
            )),
            _ => self.render(),
        }
    }

    fn render_into(&self, out: &mut String, depth: usize) -> Result<()> {
        let indent = "    ".repeat(depth);
        match self {
            Statement::Assign { target, value } => {
                check_identifier(target)?;
                out.push_str(&format!("{}{} = {}\n", indent, target, value.render()?));
            }
            Statement::SetField {
                target,
                field,
                value,
            } => {
                check_identifier(target)?;
                check_identifier(field)?;
                out.push_str(&format!("{}{}.{} = {}\n", indent, target, field, value.render()?));
            }
            Statement::Eval(expr) => {
                out.push_str(&format!("{}{}\n", indent, expr.render()?));
            }
            Statement::Def { name, body } => {
                check_identifier(name)?;
                if body.is_empty() {
                    return Err(NetError::InvalidParameter(format!(
                        "def {} has an empty body",
                        name
                    )));
                }
                out.push_str(&format!("{}def {} ():\n", indent, name));
                for stmt in body {
                    stmt.render_into(out, depth + 1)?;
                }
            }
            Statement::Query { condition } => {
                out.push_str(&format!(
                    "{i}if {c}:\n{i}    {s}.sendall (\"True\")\n{i}else:\n{i}    {s}.sendall (\"False\")\n",
                    i = indent,
                    c = condition.render()?,
                    s = REPLY_SOCKET
                ));
            }
        }
        Ok(())
    }
}

// -- builders --

pub fn var(name: impl Into<String>) -> Expr {
    Expr::Var(name.into())
}

pub fn global(path: impl Into<String>) -> Expr {
    Expr::Global(path.into())
}

pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Expr {
    Expr::Call {
        callee: callee.into(),
        args,
    }
}

pub fn kw(name: impl Into<String>, value: Expr) -> Expr {
    Expr::Keyword {
        name: name.into(),
        value: Box::new(value),
    }
}

pub fn list(items: Vec<Expr>) -> Expr {
    Expr::List(items)
}

pub fn string(s: impl Into<String>) -> Expr {
    Expr::Lit(Literal::Str(s.into()))
}

pub fn float(v: f64) -> Expr {
    Expr::Lit(Literal::Float(v))
}

pub fn uint(v: u64) -> Expr {
    Expr::Lit(Literal::Uint(v))
}

pub fn int(v: i64) -> Expr {
    Expr::Lit(Literal::Int(v))
}

pub fn boolean(v: bool) -> Expr {
    Expr::Lit(Literal::Bool(v))
}

/// `StringValue ("s")`
pub fn string_value(s: impl Into<String>) -> Expr {
    call("StringValue", vec![string(s)])
}

/// `BooleanValue (b)`
pub fn boolean_value(b: bool) -> Expr {
    call("BooleanValue", vec![boolean(b)])
}

/// `UintegerValue (v)`
pub fn uinteger_value(v: u64) -> Expr {
    call("UintegerValue", vec![uint(v)])
}

/// `DoubleValue (v)`
pub fn double_value(v: f64) -> Expr {
    call("DoubleValue", vec![float(v)])
}

/// `GlobalValue.Bind ("key", value)`
pub fn global_bind(key: &str, value: Expr) -> Statement {
    Statement::eval(call("GlobalValue.Bind", vec![string(key), value]))
}

/// `Config.SetDefault ("path", value)`
pub fn set_default(path: &str, value: Expr) -> Statement {
    Statement::eval(call("Config.SetDefault", vec![string(path), value]))
}

/// `helper.SetAttribute ("name", value)`
pub fn set_attribute(helper: &str, name: &str, value: Expr) -> Statement {
    Statement::eval(var(helper).method("SetAttribute", vec![string(name), value]))
}

/// `LogComponentEnable ("component", level)`
pub fn log_component(component: &str, level: &str) -> Statement {
    Statement::eval(call("LogComponentEnable", vec![string(component), global(level)]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_bind_shape() {
        let stmt = global_bind("ChecksumEnabled", boolean_value(true));
        assert_eq!(
            stmt.render().unwrap(),
            "GlobalValue.Bind (\"ChecksumEnabled\", BooleanValue (True))\n"
        );
        assert!(stmt.references().is_empty());
        assert_eq!(stmt.defines(), None);
    }

    #[test]
    fn test_assign_shape() {
        let stmt = Statement::assign("lteHelper", call("LteHelper", vec![]));
        assert_eq!(stmt.render().unwrap(), "lteHelper = LteHelper ()\n");
        assert_eq!(stmt.defines(), Some("lteHelper"));
    }

    #[test]
    fn test_set_attribute_shape() {
        let stmt = set_attribute("tapBridgeHelper", "DeviceName", string_value("h1-eth0"));
        assert_eq!(
            stmt.render().unwrap(),
            "tapBridgeHelper.SetAttribute (\"DeviceName\", StringValue (\"h1-eth0\"))\n"
        );
        assert_eq!(stmt.references(), vec!["tapBridgeHelper"]);
    }

    #[test]
    fn test_double_value_renders_float_literal() {
        let stmt = set_default("ns3::LteEnbPhy::TxPower", double_value(23.5));
        assert_eq!(
            stmt.render().unwrap(),
            "Config.SetDefault (\"ns3::LteEnbPhy::TxPower\", DoubleValue (23.5))\n"
        );
        let stmt = set_default("ns3::LteEnbPhy::TxPower", double_value(30.0));
        assert!(stmt.render().unwrap().contains("DoubleValue (30.0)"));
    }

    #[test]
    fn test_query_shape() {
        let stmt = Statement::query(var("tapBridges").index(0).method("IsLinkUp", vec![]));
        assert_eq!(
            stmt.render().unwrap(),
            "if tapBridges[0].IsLinkUp ():\n    csock.sendall (\"True\")\nelse:\n    csock.sendall (\"False\")\n"
        );
        assert_eq!(stmt.references(), vec!["tapBridges", "csock"]);
        assert!(stmt.expects_reply());
    }

    #[test]
    fn test_tagged_query_keeps_statement_valid() {
        let stmt = Statement::query(var("nsThread").method("isAlive", vec![]));
        let text = stmt.render_tagged(7).unwrap();
        assert!(text.starts_with("if nsThread.isAlive ():  # seq 7\n"));
        assert!(text.ends_with("csock.sendall (\"False\")\n"));

        let plain = Statement::assign("x", uint(1));
        assert_eq!(plain.render_tagged(3).unwrap(), "x = 1\n");
    }

    #[test]
    fn test_empty_list() {
        let stmt = Statement::assign("tapBridges", list(vec![]));
        assert_eq!(stmt.render().unwrap(), "tapBridges = []\n");
        assert_eq!(stmt.defines(), Some("tapBridges"));
    }

    #[test]
    fn test_def_block() {
        let stmt = Statement::def(
            "run",
            vec![
                Statement::eval(call("Simulator.Stop", vec![call("Seconds", vec![uint(86400)])])),
                Statement::eval(call("Simulator.Run", vec![])),
            ],
        );
        assert_eq!(
            stmt.render().unwrap(),
            "def run ():\n    Simulator.Stop (Seconds (86400))\n    Simulator.Run ()\n"
        );
        assert_eq!(stmt.defines(), Some("run"));
        assert!(Statement::def("empty", vec![]).render().is_err());
    }

    #[test]
    fn test_keyword_and_chained_method() {
        let stmt = Statement::assign("nsThread", call("Thread", vec![kw("target", var("run"))]));
        assert_eq!(stmt.render().unwrap(), "nsThread = Thread (target = run)\n");
        assert_eq!(stmt.references(), vec!["run"]);

        let install = var("wifihelper")
            .method("Install", vec![var("phyhelper"), var("machelper"), var("nsNode")])
            .method("Get", vec![uint(0)]);
        let stmt = Statement::assign("wifiDev", install);
        assert_eq!(
            stmt.render().unwrap(),
            "wifiDev = wifihelper.Install (phyhelper, machelper, nsNode).Get (0)\n"
        );
        assert_eq!(stmt.references(), vec!["wifihelper", "phyhelper", "machelper", "nsNode"]);
    }

    #[test]
    fn test_set_field() {
        let stmt = Statement::set_field("pf", "localPortStart", uint(0));
        assert_eq!(stmt.render().unwrap(), "pf.localPortStart = 0\n");
        assert_eq!(stmt.references(), vec!["pf"]);
    }

    #[test]
    fn test_rejects_injected_names() {
        let stmt = Statement::assign("x; import os", uint(1));
        assert!(matches!(stmt.render(), Err(NetError::InvalidParameter(_))));

        let stmt = Statement::eval(global("EpsBearer.NGBR_VIDEO_TCP_DEFAULT)\nos.system(1"));
        assert!(stmt.render().is_err());

        let stmt = Statement::eval(call("", vec![]));
        assert!(stmt.render().is_err());
    }

    #[test]
    fn test_string_parameters_are_quoted() {
        let stmt = set_attribute("tapBridgeHelper", "DeviceName", string_value("a\"b"));
        assert!(stmt.render().unwrap().contains("StringValue (\"a\\\"b\")"));
    }
}
