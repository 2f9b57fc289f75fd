//! Arena DOM for content documents.
//!
//! Well-formed XHTML is read with roxmltree. Anything the XML parser
//! rejects (HTML named entities, unclosed void elements, `text/html`
//! chapters) goes through html5ever's tree builder instead, so every
//! document ends up as the same tree.

use html5ever::tendril::{StrTendril, TendrilSink};
use html5ever::tree_builder::{ElementFlags, NodeOrText, QuirksMode, TreeSink};
use html5ever::{Attribute, ParseOpts, QualName, parse_document};
use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::Rc;

/// Node payload.
#[derive(Debug, Clone)]
enum NodeKind {
    Document,
    Element {
        /// Lowercased local name.
        tag: String,
        /// (local name, value) pairs.
        attrs: Vec<(String, String)>,
    },
    Text(String),
    /// Comments, processing instructions, doctypes.
    Other,
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Parsed content document.
#[derive(Debug, Clone)]
pub struct Dom {
    nodes: Vec<NodeData>,
}

/// Which parser produced a [`Dom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    Xml,
    Html,
}

const DOCUMENT: usize = 0;

impl Dom {
    fn new() -> Self {
        Self {
            nodes: vec![NodeData {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    /// Parse markup, strictly as XML first and as HTML when that fails.
    pub fn parse(markup: &str) -> (Self, Syntax) {
        match super::extract::parse_xml(markup) {
            Ok(xml) => (Self::from_xml(&xml), Syntax::Xml),
            Err(e) => {
                tracing::debug!(error = %e, "Markup is not well-formed XML, parsing as HTML");
                (Self::parse_html(markup), Syntax::Html)
            }
        }
    }

    /// Parse markup with the HTML tree builder.
    pub fn parse_html(markup: &str) -> Self {
        parse_document(DomSink::default(), ParseOpts::default())
            .from_utf8()
            .one(markup.as_bytes())
    }

    fn from_xml(xml: &roxmltree::Document<'_>) -> Self {
        let mut dom = Self::new();
        let mut stack = vec![(xml.root(), DOCUMENT)];
        while let Some((source, parent)) = stack.pop() {
            for child in source.children() {
                let kind = if child.is_element() {
                    NodeKind::Element {
                        tag: child.tag_name().name().to_ascii_lowercase(),
                        attrs: child
                            .attributes()
                            .map(|a| (a.name().to_string(), a.value().to_string()))
                            .collect(),
                    }
                } else if let Some(text) = child.text().filter(|_| child.is_text()) {
                    NodeKind::Text(text.to_string())
                } else {
                    continue;
                };
                let id = dom.alloc(kind);
                dom.append(parent, id);
                if child.is_element() {
                    stack.push((child, id));
                }
            }
        }
        dom
    }

    fn alloc(&mut self, kind: NodeKind) -> usize {
        self.nodes.push(NodeData {
            kind,
            parent: None,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    fn detach(&mut self, id: usize) {
        if let Some(parent) = self.nodes[id].parent.take() {
            self.nodes[parent].children.retain(|&c| c != id);
        }
    }

    fn append(&mut self, parent: usize, child: usize) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    /// Append text, merging with a trailing text node.
    fn append_text(&mut self, parent: usize, text: &str) {
        if let Some(&last) = self.nodes[parent].children.last()
            && let NodeKind::Text(existing) = &mut self.nodes[last].kind
        {
            existing.push_str(text);
            return;
        }
        let id = self.alloc(NodeKind::Text(text.to_string()));
        self.append(parent, id);
    }

    fn insert_before(&mut self, sibling: usize, child: usize) {
        let Some(parent) = self.nodes[sibling].parent else {
            return;
        };
        self.detach(child);
        let siblings = &mut self.nodes[parent].children;
        let position = siblings
            .iter()
            .position(|&c| c == sibling)
            .unwrap_or(siblings.len());
        siblings.insert(position, child);
        self.nodes[child].parent = Some(parent);
    }

    /// The document node.
    pub fn root(&self) -> NodeRef<'_> {
        NodeRef {
            dom: self,
            id: DOCUMENT,
        }
    }

    /// First element, normally `html`.
    pub fn root_element(&self) -> NodeRef<'_> {
        self.root()
            .children()
            .find(NodeRef::is_element)
            .unwrap_or_else(|| self.root())
    }
}

/// Borrowed view of one node.
#[derive(Clone, Copy)]
pub struct NodeRef<'d> {
    dom: &'d Dom,
    id: usize,
}

impl std::fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NodeRef").field(&self.data().kind).finish()
    }
}

impl<'d> NodeRef<'d> {
    fn data(&self) -> &'d NodeData {
        &self.dom.nodes[self.id]
    }

    /// Child nodes in document order.
    pub fn children(&self) -> impl Iterator<Item = NodeRef<'d>> + 'd {
        let dom = self.dom;
        self.data()
            .children
            .iter()
            .map(move |&id| NodeRef { dom, id })
    }

    /// This node and everything below it, in document order.
    pub fn descendants(&self) -> impl Iterator<Item = NodeRef<'d>> + 'd {
        let dom = self.dom;
        let mut stack = vec![self.id];
        std::iter::from_fn(move || {
            let id = stack.pop()?;
            stack.extend(dom.nodes[id].children.iter().rev());
            Some(NodeRef { dom, id })
        })
    }

    pub fn is_element(&self) -> bool {
        matches!(self.data().kind, NodeKind::Element { .. })
    }

    pub fn is_text(&self) -> bool {
        matches!(self.data().kind, NodeKind::Text(_))
    }

    /// Content of a text node.
    pub fn text(&self) -> Option<&'d str> {
        match &self.data().kind {
            NodeKind::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Lowercased tag name; empty for non-elements.
    pub fn tag(&self) -> &'d str {
        match &self.data().kind {
            NodeKind::Element { tag, .. } => tag,
            _ => "",
        }
    }

    /// Attribute by local name, so `xlink:href` answers to `href`.
    pub fn attribute(&self, name: &str) -> Option<&'d str> {
        match &self.data().kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

/// Node handle for the tree builder; elements keep their name at hand.
#[derive(Clone)]
struct Handle {
    id: usize,
    name: Rc<QualName>,
}

/// html5ever tree sink building a [`Dom`].
struct DomSink {
    dom: RefCell<Dom>,
    unnamed: Rc<QualName>,
}

impl Default for DomSink {
    fn default() -> Self {
        Self {
            dom: RefCell::new(Dom::new()),
            unnamed: Rc::new(QualName::new(None, html5ever::ns!(), html5ever::local_name!(""))),
        }
    }
}

impl DomSink {
    fn handle(&self, id: usize) -> Handle {
        Handle {
            id,
            name: Rc::clone(&self.unnamed),
        }
    }

    fn create(&self, kind: NodeKind) -> Handle {
        let id = self.dom.borrow_mut().alloc(kind);
        self.handle(id)
    }
}

impl TreeSink for DomSink {
    type Handle = Handle;
    type Output = Dom;
    type ElemName<'a>
        = &'a QualName
    where
        Self: 'a;

    fn finish(self) -> Dom {
        self.dom.into_inner()
    }

    fn parse_error(&self, msg: Cow<'static, str>) {
        tracing::trace!(error = %msg, "HTML parse error");
    }

    fn get_document(&self) -> Handle {
        self.handle(DOCUMENT)
    }

    fn elem_name<'a>(&'a self, target: &'a Handle) -> &'a QualName {
        &target.name
    }

    fn create_element(&self, name: QualName, attrs: Vec<Attribute>, _flags: ElementFlags) -> Handle {
        let local: &str = &name.local;
        let kind = NodeKind::Element {
            tag: local.to_ascii_lowercase(),
            attrs: attrs
                .into_iter()
                .map(|a| (a.name.local.to_string(), a.value.to_string()))
                .collect(),
        };
        let id = self.dom.borrow_mut().alloc(kind);
        Handle {
            id,
            name: Rc::new(name),
        }
    }

    fn create_comment(&self, _text: StrTendril) -> Handle {
        self.create(NodeKind::Other)
    }

    fn create_pi(&self, _target: StrTendril, _data: StrTendril) -> Handle {
        self.create(NodeKind::Other)
    }

    fn append(&self, parent: &Handle, child: NodeOrText<Handle>) {
        let mut dom = self.dom.borrow_mut();
        match child {
            NodeOrText::AppendNode(node) => dom.append(parent.id, node.id),
            NodeOrText::AppendText(text) => dom.append_text(parent.id, &text),
        }
    }

    fn append_based_on_parent_node(
        &self,
        element: &Handle,
        prev_element: &Handle,
        child: NodeOrText<Handle>,
    ) {
        let has_parent = self.dom.borrow().nodes[element.id].parent.is_some();
        if has_parent {
            self.append_before_sibling(element, child);
        } else {
            self.append(prev_element, child);
        }
    }

    fn append_doctype_to_document(
        &self,
        _name: StrTendril,
        _public_id: StrTendril,
        _system_id: StrTendril,
    ) {
    }

    fn get_template_contents(&self, target: &Handle) -> Handle {
        target.clone()
    }

    fn same_node(&self, x: &Handle, y: &Handle) -> bool {
        x.id == y.id
    }

    fn set_quirks_mode(&self, _mode: QuirksMode) {}

    fn append_before_sibling(&self, sibling: &Handle, new_node: NodeOrText<Handle>) {
        let mut dom = self.dom.borrow_mut();
        let child = match new_node {
            NodeOrText::AppendNode(node) => node.id,
            NodeOrText::AppendText(text) => dom.alloc(NodeKind::Text(text.to_string())),
        };
        dom.insert_before(sibling.id, child);
    }

    fn add_attrs_if_missing(&self, target: &Handle, attrs: Vec<Attribute>) {
        let mut dom = self.dom.borrow_mut();
        if let NodeKind::Element { attrs: existing, .. } = &mut dom.nodes[target.id].kind {
            for attr in attrs {
                let name = attr.name.local.to_string();
                if !existing.iter().any(|(n, _)| *n == name) {
                    existing.push((name, attr.value.to_string()));
                }
            }
        }
    }

    fn remove_from_parent(&self, target: &Handle) {
        self.dom.borrow_mut().detach(target.id);
    }

    fn reparent_children(&self, node: &Handle, new_parent: &Handle) {
        let mut dom = self.dom.borrow_mut();
        let children = std::mem::take(&mut dom.nodes[node.id].children);
        for child in children {
            dom.nodes[child].parent = Some(new_parent.id);
            dom.nodes[new_parent.id].children.push(child);
        }
    }
}
