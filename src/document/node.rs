//! Lossless song nodes.
//!
//! Each node keeps the exact source text it was parsed from. The text is
//! dropped on first mutation, after which the node is rendered from its
//! attribute list. Untouched attributes keep their raw escaped value and
//! quote character, so only edited values change on disk.

use std::borrow::Cow;

use super::record::{CuePoint, Record, RecordField, format_float};

/// Whitespace conventions detected from the source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Layout {
    pub line_ending: &'static str,
    /// Text placed before a `<Song` (line ending + indent).
    pub song_lead: String,
    /// Text placed before a child element of a song.
    pub child_lead: String,
}

impl Layout {
    pub fn detect(text: &str) -> Self {
        let line_ending = if text.contains("\r\n") { "\r\n" } else { "\n" };
        Self {
            line_ending,
            song_lead: format!("{line_ending} "),
            child_lead: format!("{line_ending}  "),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Attr {
    pub name: String,
    /// Value exactly as written, still escaped.
    pub raw: String,
    pub quote: char,
}

impl Attr {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            raw: xml_escape(value),
            quote: '"',
        }
    }

    pub fn value(&self) -> Cow<'_, str> {
        quick_xml::escape::unescape(&self.raw).unwrap_or(Cow::Borrowed(&self.raw))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Element {
    pub name: String,
    pub attrs: Vec<Attr>,
    /// Start tag as read, with whether it was self-closing.
    pub source: Option<(String, bool)>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attrs: Vec::new(),
            source: None,
        }
    }

    pub fn from_tag(tag: &str, self_closing: bool) -> Result<Self, String> {
        let (name, attrs) = lex_start_tag(tag)?;
        Ok(Self {
            name,
            attrs,
            source: Some((tag.to_string(), self_closing)),
        })
    }

    pub fn get(&self, name: &str) -> Option<&Attr> {
        self.attrs.iter().find(|a| a.name == name)
    }

    pub fn value(&self, name: &str) -> Option<Cow<'_, str>> {
        self.get(name).map(Attr::value)
    }

    /// Replace or append an attribute. Returns false when nothing changed.
    pub fn put(&mut self, attr: Attr) -> bool {
        match self.attrs.iter_mut().find(|a| a.name == attr.name) {
            Some(existing) if existing.value() == attr.value() => false,
            Some(existing) => {
                existing.raw = if existing.quote == attr.quote {
                    attr.raw
                } else {
                    xml_escape(&attr.value())
                };
                self.source = None;
                true
            }
            None => {
                self.attrs.push(attr);
                self.source = None;
                true
            }
        }
    }

    pub fn set(&mut self, name: &str, value: &str) -> bool {
        self.put(Attr::new(name, value))
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.attrs.len();
        self.attrs.retain(|a| a.name != name);
        let removed = self.attrs.len() != before;
        if removed {
            self.source = None;
        }
        removed
    }

    fn render_open(&self, out: &mut String, self_closing: bool) {
        if let Some((raw, raw_self_closing)) = &self.source
            && *raw_self_closing == self_closing
        {
            out.push_str(raw);
            return;
        }
        out.push('<');
        out.push_str(&self.name);
        for attr in &self.attrs {
            out.push(' ');
            out.push_str(&attr.name);
            out.push('=');
            out.push(attr.quote);
            out.push_str(&attr.raw);
            out.push(attr.quote);
        }
        out.push_str(if self_closing { " />" } else { ">" });
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ChildNode {
    pub lead: String,
    pub element: Element,
    /// Inner content of a non-empty element, verbatim.
    pub body: Option<String>,
    pub source: Option<String>,
}

impl ChildNode {
    pub fn new(lead: &str, element: Element) -> Self {
        Self {
            lead: lead.to_string(),
            element,
            body: None,
            source: None,
        }
    }

    fn render(&self, out: &mut String) {
        out.push_str(&self.lead);
        if let Some(source) = &self.source {
            out.push_str(source);
            return;
        }
        match &self.body {
            Some(body) => {
                self.element.render_open(out, false);
                out.push_str(body);
                out.push_str("</");
                out.push_str(&self.element.name);
                out.push('>');
            }
            None => self.element.render_open(out, true),
        }
    }
}

fn child_rank(name: &str) -> u8 {
    match name {
        "Tags" => 0,
        "Infos" => 1,
        "Comment" => 2,
        "Scan" => 3,
        "Poi" => 4,
        _ => 5,
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SongNode {
    /// Index key; differs from the FilePath attribute while a remap is staged.
    pub key: String,
    pub lead: String,
    pub element: Element,
    pub children: Vec<ChildNode>,
    /// Text between the last child and `</Song>`.
    pub close_lead: String,
    pub self_closing: bool,
    pub source: Option<String>,
}

impl SongNode {
    pub fn render(&self, out: &mut String) {
        out.push_str(&self.lead);
        if let Some(source) = &self.source {
            out.push_str(source);
            return;
        }
        if self.self_closing && self.children.is_empty() {
            self.element.render_open(out, true);
            return;
        }
        self.element.render_open(out, false);
        for child in &self.children {
            child.render(out);
        }
        out.push_str(&self.close_lead);
        out.push_str("</");
        out.push_str(&self.element.name);
        out.push('>');
    }

    pub fn file_path(&self) -> Option<Cow<'_, str>> {
        self.element.value("FilePath")
    }

    pub fn child(&self, name: &str) -> Option<&ChildNode> {
        self.children.iter().find(|c| c.element.name == name)
    }

    fn child_index(&self, name: &str) -> Option<usize> {
        self.children.iter().position(|c| c.element.name == name)
    }

    /// Find or create the first child named `name`, in canonical position.
    pub fn ensure_child(&mut self, name: &str, layout: &Layout) -> &mut ChildNode {
        let index = match self.child_index(name) {
            Some(index) => index,
            None => self.push_in_order(ChildNode::new(&layout.child_lead, Element::new(name)), layout),
        };
        &mut self.children[index]
    }

    /// Insert after every child of equal or lower rank; returns the position.
    pub fn push_in_order(&mut self, child: ChildNode, layout: &Layout) -> usize {
        let rank = child_rank(&child.element.name);
        let at = self
            .children
            .iter()
            .position(|c| child_rank(&c.element.name) > rank)
            .unwrap_or(self.children.len());
        self.insert_child(at, child, layout);
        at
    }

    fn insert_child(&mut self, at: usize, child: ChildNode, layout: &Layout) {
        if self.children.is_empty() && (self.self_closing || self.close_lead.is_empty()) {
            self.self_closing = false;
            self.close_lead = layout.song_lead.clone();
        }
        self.children.insert(at, child);
        self.source = None;
    }

    /// Apply one already-validated field value; `None` removes the attribute.
    pub fn write_field(&mut self, field: RecordField, value: Option<&str>, layout: &Layout) -> bool {
        let element = field.element();
        let attribute = field.attribute();
        let changed = if element == "Song" {
            match value {
                Some(v) => self.element.set(attribute, v),
                None => self.element.remove(attribute),
            }
        } else {
            match value {
                Some(v) => {
                    let child = self.ensure_child(element, layout);
                    let changed = child.element.set(attribute, v);
                    if changed {
                        child.source = None;
                    }
                    changed
                }
                None => match self.child_index(element) {
                    Some(index) => {
                        let child = &mut self.children[index];
                        let changed = child.element.remove(attribute);
                        if changed {
                            child.source = None;
                        }
                        changed
                    }
                    None => false,
                },
            }
        };
        if changed {
            self.source = None;
        }
        changed
    }

    pub fn remove_children(&mut self, keep: impl Fn(&ChildNode) -> bool) -> usize {
        let before = self.children.len();
        self.children.retain(keep);
        let removed = before - self.children.len();
        if removed > 0 {
            self.source = None;
        }
        removed
    }

    /// Re-indent for a document with a different layout.
    pub fn relayout(&mut self, layout: &Layout) {
        self.lead = layout.song_lead.clone();
        for child in &mut self.children {
            child.lead = layout.child_lead.clone();
            if let Some(body) = &child.body
                && body.contains('\n')
            {
                child.body = Some(normalize_line_endings(body, layout.line_ending));
                child.source = None;
            }
        }
        if !self.children.is_empty() {
            self.close_lead = layout.song_lead.clone();
        }
        self.source = None;
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new(self.file_path().unwrap_or_default());
        for attr in &self.element.attrs {
            record.read_attribute("Song", &attr.name, &attr.value());
        }
        for child in &self.children {
            match child.element.name.as_str() {
                "Poi" => {
                    if let Some(cue) = poi_from_element(&child.element) {
                        record.cue_points.push(cue);
                    }
                }
                name @ ("Tags" | "Infos" | "Scan") => {
                    for attr in &child.element.attrs {
                        record.read_attribute(name, &attr.name, &attr.value());
                    }
                }
                _ => {}
            }
        }
        record
    }

    /// Build a fresh node from a typed record.
    pub fn from_record(record: &Record, layout: &Layout) -> Self {
        let mut element = Element::new("Song");
        element.set("FilePath", &record.file_path);
        let mut node = Self {
            key: record.file_path.clone(),
            lead: layout.song_lead.clone(),
            element,
            children: Vec::new(),
            close_lead: String::new(),
            self_closing: true,
            source: None,
        };
        for field in RecordField::ALL {
            if let Some(text) = record.field_text(*field) {
                node.write_field(*field, Some(&text), layout);
            }
        }
        for (qualified, value) in &record.extra {
            if let Some((element, attribute)) = qualified.split_once('.') {
                if element == "Song" {
                    node.element.set(attribute, value);
                } else {
                    node.ensure_child(element, layout)
                        .element
                        .set(attribute, value);
                }
            }
        }
        for cue in &record.cue_points {
            node.push_in_order(ChildNode::new(&layout.child_lead, poi_element(cue)), layout);
        }
        node
    }
}

pub(crate) fn poi_element(cue: &CuePoint) -> Element {
    let mut element = Element::new("Poi");
    if let Some(name) = &cue.name {
        element.set("Name", name);
    }
    element.set("Pos", &format_float(cue.pos));
    if let Some(num) = cue.num {
        element.set("Num", &num.to_string());
    }
    element.set("Type", cue.kind.as_str());
    if let Some(color) = &cue.color {
        element.set("Color", color);
    }
    element
}

fn poi_from_element(element: &Element) -> Option<CuePoint> {
    use super::record::PoiKind;
    let pos = element.value("Pos")?.trim().parse::<f64>().ok()?;
    Some(CuePoint {
        kind: element
            .value("Type")
            .map(|t| PoiKind::parse(&t))
            .unwrap_or(PoiKind::Cue),
        pos,
        num: element.value("Num").and_then(|n| n.trim().parse().ok()),
        name: element.value("Name").map(Cow::into_owned),
        color: element.value("Color").map(Cow::into_owned),
    })
}

fn normalize_line_endings(text: &str, line_ending: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', line_ending)
}

/// Escape an attribute value. Apostrophes become `&apos;`.
pub(crate) fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '\t' => out.push_str("&#9;"),
            _ => out.push(c),
        }
    }
    out
}

/// Split a raw start tag (`<Name a="1" b='2'>` or `.../>`) into its name
/// and attribute layout, keeping raw values and quote characters.
pub(crate) fn lex_start_tag(tag: &str) -> Result<(String, Vec<Attr>), String> {
    let inner = tag
        .strip_prefix('<')
        .ok_or_else(|| format!("not a start tag: {tag}"))?;
    let inner = inner.strip_suffix('>').unwrap_or(inner);
    let inner = inner.strip_suffix('/').unwrap_or(inner);

    let name_end = inner
        .find(|c: char| c.is_ascii_whitespace())
        .unwrap_or(inner.len());
    let name = inner[..name_end].to_string();
    let mut rest = &inner[name_end..];
    let mut attrs = Vec::new();

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let eq = rest
            .find('=')
            .ok_or_else(|| format!("attribute without value in <{name}>"))?;
        let attr_name = rest[..eq].trim_end();
        if attr_name.is_empty() || attr_name.contains(char::is_whitespace) {
            return Err(format!("malformed attribute in <{name}>"));
        }
        rest = rest[eq + 1..].trim_start();
        let quote = rest
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| format!("unquoted value for {attr_name} in <{name}>"))?;
        let body = &rest[1..];
        let close = body
            .find(quote)
            .ok_or_else(|| format!("unterminated value for {attr_name} in <{name}>"))?;
        attrs.push(Attr {
            name: attr_name.to_string(),
            raw: body[..close].to_string(),
            quote,
        });
        rest = &body[close + 1..];
    }
    Ok((name, attrs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lex_keeps_raw_values_and_quotes() {
        let (name, attrs) =
            lex_start_tag(r#"<Tags Author="A &amp; B" Title='It&apos;s' Flag = "1" />"#).unwrap();
        assert_eq!(name, "Tags");
        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs[0].raw, "A &amp; B");
        assert_eq!(attrs[0].value(), "A & B");
        assert_eq!(attrs[1].quote, '\'');
        assert_eq!(attrs[1].value(), "It's");
        assert_eq!(attrs[2].name, "Flag");
    }

    #[test]
    fn lex_rejects_unterminated_value() {
        assert!(lex_start_tag(r#"<Song FilePath="/a.mp3>"#).is_err());
    }

    #[test]
    fn escape_writes_apos_entity() {
        assert_eq!(xml_escape("Don't <stop> & \"go\""), "Don&apos;t &lt;stop&gt; &amp; &quot;go&quot;");
    }

    #[test]
    fn unchanged_value_keeps_source() {
        let mut element = Element::from_tag(r#"<Tags Author='DJ &amp; Co'/>"#, true).unwrap();
        assert!(!element.set("Author", "DJ & Co"));
        let mut out = String::new();
        element.render_open(&mut out, true);
        assert_eq!(out, "<Tags Author='DJ &amp; Co'/>");
    }

    #[test]
    fn edited_element_renders_canonically() {
        let mut element = Element::from_tag(r#"<Tags Author='A' Title="T"/>"#, true).unwrap();
        assert!(element.set("Title", "Rock'n"));
        let mut out = String::new();
        element.render_open(&mut out, true);
        assert_eq!(out, r#"<Tags Author='A' Title="Rock&apos;n" />"#);
    }

    #[test]
    fn new_children_follow_canonical_order() {
        let layout = Layout::detect("<a>\n</a>");
        let record = Record::new("/m/a.mp3");
        let mut node = SongNode::from_record(&record, &layout);
        node.write_field(RecordField::ScanBpm, Some("0.5"), &layout);
        node.write_field(RecordField::Title, Some("T"), &layout);
        node.write_field(RecordField::Bitrate, Some("320"), &layout);
        let names: Vec<_> = node.children.iter().map(|c| c.element.name.as_str()).collect();
        assert_eq!(names, vec!["Tags", "Infos", "Scan"]);

        let mut out = String::new();
        node.render(&mut out);
        assert_eq!(
            out,
            "\n <Song FilePath=\"/m/a.mp3\">\n  <Tags Title=\"T\" />\n  <Infos Bitrate=\"320\" />\n  <Scan Bpm=\"0.5\" />\n </Song>"
        );
    }
}
