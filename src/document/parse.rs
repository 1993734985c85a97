use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::events::Event;

use super::node::{ChildNode, Element, Layout, SongNode};
use crate::error::{CatalogError, Result};

/// A parsed catalog split into verbatim spans.
///
/// Concatenating `preamble`, every node (lead + text), and `epilogue`
/// reproduces the input exactly.
#[derive(Debug)]
pub(crate) struct ParsedDocument {
    pub bom: bool,
    pub preamble: String,
    pub root_name: String,
    pub root_self_closing: bool,
    pub nodes: Vec<SongNode>,
    pub index: HashMap<String, usize>,
    pub epilogue: String,
    pub layout: Layout,
    /// Songs kept as opaque text (no FilePath, or a repeated one).
    pub skipped: usize,
}

struct OpenSong {
    start: usize,
    element: Element,
    children: Vec<ChildNode>,
    cursor: usize,
}

struct OpenChild {
    start: usize,
    body_start: usize,
    lead: String,
    element: Element,
}

struct Collector<'a> {
    text: &'a str,
    cursor: usize,
    nodes: Vec<SongNode>,
    index: HashMap<String, usize>,
    skipped: usize,
}

impl Collector<'_> {
    fn commit(&mut self, open: OpenSong, end: usize, close_lead: String, self_closing: bool) {
        let key = open
            .element
            .value("FilePath")
            .map(|v| v.into_owned())
            .unwrap_or_default();
        if key.is_empty() {
            tracing::warn!(offset = open.start, "Song without FilePath kept verbatim");
            self.skipped += 1;
            return;
        }
        if self.index.contains_key(&key) {
            tracing::warn!(path = %key, "duplicate Song entry kept verbatim; first entry wins");
            self.skipped += 1;
            return;
        }
        let node = SongNode {
            key: key.clone(),
            lead: self.text[self.cursor..open.start].to_string(),
            element: open.element,
            children: open.children,
            close_lead,
            self_closing,
            source: Some(self.text[open.start..end].to_string()),
        };
        self.index.insert(key, self.nodes.len());
        self.nodes.push(node);
        self.cursor = end;
    }
}

fn corrupt(detail: impl Into<String>) -> CatalogError {
    CatalogError::corrupt("catalog document", detail)
}

fn element_at(text: &str, start: usize, end: usize, self_closing: bool) -> Result<Element> {
    let tag = &text[start..end];
    let element = Element::from_tag(tag, self_closing).map_err(corrupt)?;
    for attr in &element.attrs {
        quick_xml::escape::unescape(&attr.raw).map_err(|e| {
            corrupt(format!("attribute {} of <{}> at byte {start}: {e}", attr.name, element.name))
        })?;
    }
    Ok(element)
}

fn reject_unsafe_doctype(decl: &str) -> Result<()> {
    for marker in ["<!ENTITY", "SYSTEM", "PUBLIC"] {
        if decl.contains(marker) {
            return Err(corrupt(format!("DOCTYPE declares {marker}; refusing to expand")));
        }
    }
    Ok(())
}

/// Split a catalog into a preamble, indexed song nodes, and an epilogue in one pass.
pub(crate) fn parse_document(source: &str) -> Result<ParsedDocument> {
    let (bom, text) = match source.strip_prefix('\u{feff}') {
        Some(rest) => (true, rest),
        None => (false, source),
    };

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(false);

    let mut collector = Collector {
        text,
        cursor: 0,
        nodes: Vec::new(),
        index: HashMap::new(),
        skipped: 0,
    };
    let mut depth = 0usize;
    let mut root_name: Option<String> = None;
    let mut root_self_closing = false;
    let mut root_closed = false;
    let mut preamble_end = 0usize;
    let mut song: Option<OpenSong> = None;
    let mut child: Option<OpenChild> = None;

    loop {
        let start = reader.buffer_position() as usize;
        let event = reader.read_event().map_err(|e| {
            corrupt(format!("{e} at byte {}", reader.error_position()))
        })?;
        let end = reader.buffer_position() as usize;

        match event {
            Event::Eof => break,
            Event::DocType(_) => reject_unsafe_doctype(&text[start..end])?,
            Event::Text(t) => {
                t.unescape()
                    .map_err(|e| corrupt(format!("text at byte {start}: {e}")))?;
            }
            Event::Start(e) => {
                match depth {
                    0 => {
                        if root_name.is_some() {
                            return Err(corrupt("multiple root elements"));
                        }
                        root_name = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                        element_at(text, start, end, false)?;
                        preamble_end = end;
                        collector.cursor = end;
                    }
                    1 if e.name().as_ref() == b"Song" => {
                        song = Some(OpenSong {
                            start,
                            element: element_at(text, start, end, false)?,
                            children: Vec::new(),
                            cursor: end,
                        });
                    }
                    2 => {
                        let element = element_at(text, start, end, false)?;
                        if let Some(open) = song.as_ref() {
                            child = Some(OpenChild {
                                start,
                                body_start: end,
                                lead: text[open.cursor..start].to_string(),
                                element,
                            });
                        }
                    }
                    _ => {
                        element_at(text, start, end, false)?;
                    }
                }
                depth += 1;
            }
            Event::Empty(e) => match depth {
                0 => {
                    if root_name.is_some() {
                        return Err(corrupt("multiple root elements"));
                    }
                    root_name = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                    element_at(text, start, end, true)?;
                    root_self_closing = true;
                    root_closed = true;
                    preamble_end = end;
                    collector.cursor = end;
                }
                1 if e.name().as_ref() == b"Song" => {
                    let open = OpenSong {
                        start,
                        element: element_at(text, start, end, true)?,
                        children: Vec::new(),
                        cursor: end,
                    };
                    collector.commit(open, end, String::new(), true);
                }
                2 => {
                    let element = element_at(text, start, end, true)?;
                    if let Some(open) = song.as_mut() {
                        open.children.push(ChildNode {
                            lead: text[open.cursor..start].to_string(),
                            element,
                            body: None,
                            source: Some(text[start..end].to_string()),
                        });
                        open.cursor = end;
                    }
                }
                _ => {
                    element_at(text, start, end, true)?;
                }
            },
            Event::End(e) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| corrupt(format!("unexpected end tag at byte {start}")))?;
                match depth {
                    0 => root_closed = true,
                    1 if e.name().as_ref() == b"Song" => {
                        if let Some(open) = song.take() {
                            let close_lead = text[open.cursor..start].to_string();
                            collector.commit(open, end, close_lead, false);
                        }
                    }
                    2 => {
                        if let (Some(open), Some(done)) = (song.as_mut(), child.take()) {
                            open.children.push(ChildNode {
                                lead: done.lead,
                                element: done.element,
                                body: Some(text[done.body_start..start].to_string()),
                                source: Some(text[done.start..end].to_string()),
                            });
                            open.cursor = end;
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    let Some(root_name) = root_name else {
        return Err(corrupt("no root element"));
    };
    if !root_closed || depth != 0 {
        return Err(corrupt("unexpected end of document"));
    }

    let mut layout = Layout::detect(text);
    if let Some(first) = collector.nodes.first()
        && is_indent(&first.lead)
    {
        layout.song_lead = first.lead.clone();
    }
    if let Some(lead) = collector
        .nodes
        .iter()
        .flat_map(|n| n.children.iter())
        .map(|c| &c.lead)
        .find(|lead| is_indent(lead))
    {
        layout.child_lead = lead.clone();
    }

    Ok(ParsedDocument {
        bom,
        preamble: text[..preamble_end].to_string(),
        root_name,
        root_self_closing,
        epilogue: text[collector.cursor..].to_string(),
        nodes: collector.nodes,
        index: collector.index,
        layout,
        skipped: collector.skipped,
    })
}

fn is_indent(lead: &str) -> bool {
    lead.contains('\n') && lead.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(parsed: &ParsedDocument) -> String {
        let mut out = String::new();
        if parsed.bom {
            out.push('\u{feff}');
        }
        out.push_str(&parsed.preamble);
        for node in &parsed.nodes {
            node.render(&mut out);
        }
        out.push_str(&parsed.epilogue);
        out
    }

    const SAMPLE: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n<VirtualDJ_Database Version=\"2023\">\r\n <Song FilePath=\"/m/a.mp3\" FileSize=\"100\">\r\n  <Tags Author=\"A\" Title=\"One\" />\r\n  <Comment>free text</Comment>\r\n  <Poi Pos=\"1.5\" Type=\"cue\" Num=\"1\" />\r\n </Song>\r\n <!-- note -->\r\n <Song FilePath='/m/b.mp3' />\r\n</VirtualDJ_Database>\r\n";

    #[test]
    fn spans_reassemble_to_source() {
        let parsed = parse_document(SAMPLE).unwrap();
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(reassemble(&parsed), SAMPLE);
        assert_eq!(parsed.root_name, "VirtualDJ_Database");
        assert_eq!(parsed.layout.line_ending, "\r\n");
        assert_eq!(parsed.layout.song_lead, "\r\n ");
        assert_eq!(parsed.layout.child_lead, "\r\n  ");
    }

    #[test]
    fn index_points_at_nodes() {
        let parsed = parse_document(SAMPLE).unwrap();
        assert_eq!(parsed.index["/m/a.mp3"], 0);
        assert_eq!(parsed.index["/m/b.mp3"], 1);
        assert_eq!(parsed.nodes[0].children.len(), 3);
        assert!(parsed.nodes[1].self_closing);
    }

    #[test]
    fn duplicate_and_keyless_songs_stay_verbatim() {
        let src = "<R>\n <Song FilePath=\"/a\"/>\n <Song/>\n <Song FilePath=\"/a\"><Tags/></Song>\n <Song FilePath=\"/b\"/>\n</R>";
        let parsed = parse_document(src).unwrap();
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.skipped, 2);
        assert_eq!(reassemble(&parsed), src);
    }

    #[test]
    fn bom_is_restored() {
        let src = "\u{feff}<R>\n <Song FilePath=\"/a\"/>\n</R>";
        let parsed = parse_document(src).unwrap();
        assert!(parsed.bom);
        assert_eq!(reassemble(&parsed), src);
    }

    #[test]
    fn entity_declarations_are_rejected() {
        let src = "<?xml version=\"1.0\"?>\n<!DOCTYPE R [<!ENTITY x \"boom\">]>\n<R><Song FilePath=\"&x;\"/></R>";
        assert!(matches!(parse_document(src), Err(CatalogError::Corrupt { .. })));
        let external = "<!DOCTYPE R SYSTEM \"file:///etc/passwd\">\n<R/>";
        assert!(matches!(parse_document(external), Err(CatalogError::Corrupt { .. })));
    }

    #[test]
    fn unknown_entity_reference_is_rejected() {
        let src = "<R><Song FilePath=\"/a&bogus;\"/></R>";
        assert!(matches!(parse_document(src), Err(CatalogError::Corrupt { .. })));
    }

    #[test]
    fn truncated_document_is_corrupt() {
        let src = "<R>\n <Song FilePath=\"/a\">\n  <Tags Title=\"x\"/>\n";
        assert!(matches!(parse_document(src), Err(CatalogError::Corrupt { .. })));
        assert!(matches!(parse_document(""), Err(CatalogError::Corrupt { .. })));
    }

    #[test]
    fn self_closing_root() {
        let parsed = parse_document("<?xml version=\"1.0\"?>\n<VirtualDJ_Database Version=\"8\"/>\n").unwrap();
        assert!(parsed.root_self_closing);
        assert!(parsed.nodes.is_empty());
        assert_eq!(parsed.epilogue, "\n");
    }
}
