use std::fmt;

const CHANGE_IN: &str = "change_in";

/// A `when` condition split into plain text and `change_in` calls.
///
/// Only the calls are understood; the text around them is kept verbatim so
/// the rest of the condition is left for the pipeline runtime to evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    ChangeIn(ChangeInCall),
    Literal(bool),
}

/// A parsed `change_in(<paths>[, <options>])` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeInCall {
    /// The call exactly as written.
    pub source: String,
    pub filters: Vec<String>,
    pub options: Options,
}

/// The optional second argument of `change_in`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Options {
    pub default_branch: Option<String>,
    pub range: Option<String>,
    pub on_tags: Option<bool>,
    pub exclude: Vec<String>,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, String> {
        Ok(Self {
            segments: Parser::new(source).collect::<Result<_, _>>()?,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn calls(&self) -> impl Iterator<Item = &ChangeInCall> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::ChangeIn(call) => Some(call),
            _ => None,
        })
    }

    pub fn has_calls(&self) -> bool {
        self.calls().next().is_some()
    }

    /// Replace every call with the literal `resolve` returns for it.
    pub fn substitute<E>(
        &mut self,
        mut resolve: impl FnMut(&ChangeInCall) -> Result<bool, E>,
    ) -> Result<(), E> {
        for segment in &mut self.segments {
            if let Segment::ChangeIn(call) = segment {
                *segment = Segment::Literal(resolve(call)?);
            }
        }
        Ok(())
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => f.write_str(text)?,
                Segment::ChangeIn(call) => f.write_str(&call.source)?,
                Segment::Literal(value) => write!(f, "{value}")?,
            }
        }
        Ok(())
    }
}

impl ChangeInCall {
    /// Calls with equal keys always resolve to the same value.
    pub fn key(&self) -> String {
        format!("{:?}|{:?}", self.filters, self.options)
    }

    /// The filters as they appear in logs.
    pub fn describe(&self) -> String {
        self.filters.join(", ")
    }
}

/// Argument values accepted inside a call.
#[derive(Debug)]
enum Value {
    String(String),
    Bool(bool),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::String(_) => "a string",
            Value::Bool(_) => "a boolean",
            Value::List(_) => "a list",
            Value::Map(_) => "a map",
        }
    }

    fn into_strings(self, what: &str) -> Result<Vec<String>, String> {
        match self {
            Value::String(value) => Ok(vec![value]),
            Value::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(value) => Ok(value),
                    other => Err(format!("{what} must contain strings, found {}", other.kind())),
                })
                .collect(),
            other => Err(format!(
                "{what} must be a string or a list of strings, found {}",
                other.kind()
            )),
        }
    }
}

impl TryFrom<Value> for Options {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Map(entries) = value else {
            return Err(format!("options must be a map, found {}", value.kind()));
        };
        let mut options = Options::default();
        for (key, value) in entries {
            match (key.as_str(), value) {
                ("default_branch", Value::String(branch)) => options.default_branch = Some(branch),
                ("range", Value::String(range)) => options.range = Some(range),
                ("on_tags", Value::Bool(on_tags)) => options.on_tags = Some(on_tags),
                ("exclude", value) => options.exclude = value.into_strings("exclude")?,
                ("default_branch" | "range" | "on_tags", value) => {
                    return Err(format!("option {key:?} cannot be {}", value.kind()))
                }
                (key, _) => return Err(format!("unknown option {key:?}")),
            }
        }
        Ok(options)
    }
}

struct Parser<'a> {
    source: &'a str,
    position: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            position: 0,
        }
    }

    fn rest(&self) -> &'a str {
        &self.source[self.position..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.position += c.len_utf8();
        Some(c)
    }

    fn skip_whitespaces(&mut self) {
        let rest = self.rest();
        self.position += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_whitespaces();
        if self.peek() == Some(c) {
            self.position += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), String> {
        if self.eat(c) {
            return Ok(());
        }
        Err(match self.peek() {
            Some(found) => format!("expected '{c}' at offset {}, found '{found}'", self.position),
            None => format!("expected '{c}' at offset {}, found end of input", self.position),
        })
    }

    fn identifier(&mut self) -> &'a str {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !is_identifier(c))
            .unwrap_or(rest.len());
        self.position += len;
        &rest[..len]
    }

    /// Offset of the next `change_in(` outside quotes, or the end of input.
    fn find_call(&self) -> usize {
        let bytes = self.source.as_bytes();
        let mut index = self.position;
        while index < bytes.len() {
            match bytes[index] {
                quote @ (b'\'' | b'"') => {
                    index += 1;
                    while index < bytes.len() && bytes[index] != quote {
                        index += if bytes[index] == b'\\' { 2 } else { 1 };
                    }
                    index += 1;
                }
                b'c' if self.source[index..].starts_with(CHANGE_IN)
                    && (index == 0 || !is_identifier(bytes[index - 1] as char))
                    && self.source[index + CHANGE_IN.len()..]
                        .trim_start()
                        .starts_with('(') =>
                {
                    return index;
                }
                _ => index += 1,
            }
        }
        bytes.len()
    }

    fn parse_string(&mut self, quote: char) -> Result<String, String> {
        let start = self.position;
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(value),
                Some('\\') => match self.bump() {
                    Some(c) => value.push(c),
                    None => break,
                },
                Some(c) => value.push(c),
                None => break,
            }
        }
        Err(format!("unterminated string starting at offset {start}"))
    }

    fn parse_value(&mut self) -> Result<Value, String> {
        self.skip_whitespaces();
        match self.peek() {
            Some(quote @ ('\'' | '"')) => self.parse_string(quote).map(Value::String),
            Some('[') => {
                self.bump();
                let mut items = Vec::new();
                while !self.eat(']') {
                    items.push(self.parse_value()?);
                    if !self.eat(',') {
                        self.expect(']')?;
                        break;
                    }
                }
                Ok(Value::List(items))
            }
            Some('{') => {
                self.bump();
                let mut entries = Vec::new();
                while !self.eat('}') {
                    self.skip_whitespaces();
                    let key = match self.peek() {
                        Some(quote @ ('\'' | '"')) => self.parse_string(quote)?,
                        _ => self.identifier().to_owned(),
                    };
                    if key.is_empty() {
                        return Err(format!("expected an option name at offset {}", self.position));
                    }
                    self.expect(':')?;
                    entries.push((key, self.parse_value()?));
                    if !self.eat(',') {
                        self.expect('}')?;
                        break;
                    }
                }
                Ok(Value::Map(entries))
            }
            Some(c) if is_identifier(c) => {
                let start = self.position;
                match self.identifier() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    other => Err(format!("unexpected {other:?} at offset {start}")),
                }
            }
            Some(c) => Err(format!("unexpected '{c}' at offset {}", self.position)),
            None => Err("unexpected end of input".to_owned()),
        }
    }

    fn parse_call(&mut self) -> Result<ChangeInCall, String> {
        let start = self.position;
        self.position += CHANGE_IN.len();
        self.expect('(')?;

        let filters = self.parse_value()?.into_strings("the first argument")?;
        if filters.is_empty() {
            return Err("change_in needs at least one path".to_owned());
        }

        let mut options = Options::default();
        if self.eat(',') {
            self.skip_whitespaces();
            if self.peek() != Some(')') {
                options = Options::try_from(self.parse_value()?)?;
                self.eat(',');
            }
        }
        self.expect(')')?;

        Ok(ChangeInCall {
            source: self.source[start..self.position].to_owned(),
            filters,
            options,
        })
    }
}

impl Iterator for Parser<'_> {
    type Item = Result<Segment, String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.source.len() {
            return None;
        }
        let call = self.find_call();
        if call > self.position {
            let text = self.source[self.position..call].to_owned();
            self.position = call;
            return Some(Ok(Segment::Text(text)));
        }
        match self.parse_call() {
            Ok(call) => Some(Ok(Segment::ChangeIn(call))),
            Err(error) => {
                // Stop after the first error.
                self.position = self.source.len();
                Some(Err(error))
            }
        }
    }
}

fn is_identifier(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
