use std::collections::BTreeMap;
use std::io::Read;

use quick_xml::Reader;
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesRef, BytesStart, Event};

use crate::engine::error::{EngineError, Result};
use crate::engine::types::{ListenerHook, ListenerPhase, Node, NodeKind, ProcessGraph, Transition};

/// Flow elements that exist in BPMN but that this engine does not execute.
const UNSUPPORTED_ELEMENTS: &[&str] = &[
    "parallelGateway",
    "inclusiveGateway",
    "eventBasedGateway",
    "complexGateway",
    "subProcess",
    "callActivity",
    "scriptTask",
    "sendTask",
    "receiveTask",
    "businessRuleTask",
    "manualTask",
    "intermediateCatchEvent",
    "intermediateThrowEvent",
    "boundaryEvent",
];

/// Largest decompressed size accepted for one process resource in a zip package.
pub const MAX_ENTRY_BYTES: u64 = 32 * 1024 * 1024;

/// Contents of a deployment package.
#[derive(Debug, Clone)]
pub struct Package {
    /// Every entry name in the package, including non-process resources.
    pub resources: Vec<String>,
    pub graphs: Vec<ProcessGraph>,
}

/// Unpack a deployment package: a zip archive, or a bare XML document.
pub fn read_package(bytes: &[u8]) -> Result<Package> {
    if bytes.is_empty() {
        return Err(EngineError::PackageFormat(
            "deployment package is empty".to_string(),
        ));
    }

    let package = if bytes.starts_with(b"PK") {
        read_zip(bytes, MAX_ENTRY_BYTES)?
    } else if trim_bom(bytes).first() == Some(&b'<') {
        Package {
            resources: vec!["process.bpmn".to_string()],
            graphs: parse_definitions(bytes, "process.bpmn")?,
        }
    } else {
        return Err(EngineError::PackageFormat(
            "package is neither a zip archive nor an XML document".to_string(),
        ));
    };

    if package.graphs.is_empty() {
        return Err(EngineError::PackageFormat(
            "no process definition found in package".to_string(),
        ));
    }
    Ok(package)
}

fn read_zip(bytes: &[u8], max_entry: u64) -> Result<Package> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| EngineError::PackageFormat(format!("failed to read zip archive: {}", e)))?;

    let mut resources = Vec::new();
    let mut graphs = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| EngineError::PackageFormat(format!("failed to read zip entry {}: {}", i, e)))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.starts_with("__MACOSX") {
            continue;
        }
        resources.push(name.clone());

        if is_process_resource(&name) {
            if entry.size() > max_entry {
                return Err(too_large(&name, max_entry));
            }
            let mut data = Vec::new();
            entry
                .by_ref()
                .take(max_entry + 1)
                .read_to_end(&mut data)
                .map_err(|e| EngineError::PackageFormat(format!("failed to read '{}': {}", name, e)))?;
            if data.len() as u64 > max_entry {
                return Err(too_large(&name, max_entry));
            }
            graphs.extend(parse_definitions(&data, &name)?);
        }
    }

    Ok(Package { resources, graphs })
}

fn too_large(name: &str, max_entry: u64) -> EngineError {
    EngineError::PackageFormat(format!(
        "entry '{}' exceeds the {} byte limit once decompressed",
        name, max_entry
    ))
}

fn is_process_resource(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".bpmn") || lower.ends_with(".bpmn20.xml") || lower.ends_with(".xml")
}

fn trim_bom(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Parse every `<process>` in a BPMN XML document.
pub fn parse_definitions(xml: &[u8], resource: &str) -> Result<Vec<ProcessGraph>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut state = ParseState::default();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            EngineError::PackageFormat(format!(
                "malformed XML in '{}' at byte {}: {}",
                resource,
                reader.buffer_position(),
                e
            ))
        })?;

        match event {
            Event::Start(ref e) => state.open(e, false, resource)?,
            Event::Empty(ref e) => state.open(e, true, resource)?,
            Event::End(ref e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                state.close(&name);
            }
            Event::Text(ref e) => {
                let text = e.xml_content().map_err(|err| {
                    EngineError::PackageFormat(format!("invalid text in '{}': {}", resource, err))
                })?;
                state.text(&text);
            }
            Event::CData(ref e) => {
                state.text(&String::from_utf8_lossy(e.as_ref()));
            }
            Event::GeneralRef(ref e) => state.text(&resolve_reference(e, resource)?),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if state.process.is_some() {
        return Err(EngineError::PackageFormat(format!(
            "unterminated <process> element in '{}'",
            resource
        )));
    }
    Ok(state.graphs)
}

/// Text capture target inside the current element.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Capture {
    None,
    Condition,
    FieldValue,
}

#[derive(Default)]
struct ParseState {
    graphs: Vec<ProcessGraph>,
    process: Option<ProcessGraph>,
    /// Flow node whose element has children still being read.
    node: Option<(String, Node)>,
    flow: Option<Transition>,
    field: Option<(String, String)>,
    capture: Option<Capture>,
    text: String,
}

impl ParseState {
    fn open(&mut self, e: &BytesStart<'_>, empty: bool, resource: &str) -> Result<()> {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();

        if name == "process" {
            let key = attr(e, "id").ok_or_else(|| {
                EngineError::PackageFormat(format!("<process> without id in '{}'", resource))
            })?;
            let display = attr(e, "name").unwrap_or_else(|| key.clone());
            let graph = ProcessGraph::new(&key, &display);
            if empty {
                self.graphs.push(graph);
            } else {
                self.process = Some(graph);
            }
            return Ok(());
        }

        if self.process.is_none() {
            return Ok(());
        }

        if UNSUPPORTED_ELEMENTS.contains(&name.as_str()) {
            return Err(EngineError::PackageFormat(format!(
                "unsupported element <{}> in '{}'",
                name, resource
            )));
        }

        if let Some(kind) = node_kind(&name, e) {
            let id = attr(e, "id").ok_or_else(|| {
                EngineError::PackageFormat(format!("<{}> without id in '{}'", name, resource))
            })?;
            let mut node = Node::new(&id, kind);
            node.name = attr(e, "name");
            if empty {
                self.push_node(node);
            } else {
                self.node = Some((name, node));
            }
            return Ok(());
        }

        match name.as_str() {
            "sequenceFlow" => {
                let (Some(id), Some(source), Some(target)) =
                    (attr(e, "id"), attr(e, "sourceRef"), attr(e, "targetRef"))
                else {
                    return Err(EngineError::PackageFormat(format!(
                        "<sequenceFlow> requires id, sourceRef and targetRef in '{}'",
                        resource
                    )));
                };
                let mut flow = Transition::new(&id, &source, &target);
                flow.name = attr(e, "name");
                if empty {
                    self.push_flow(flow);
                } else {
                    self.flow = Some(flow);
                }
            }
            "conditionExpression" if self.flow.is_some() && !empty => {
                self.capture = Some(Capture::Condition);
                self.text.clear();
            }
            "executionListener" => {
                if let Some((_, node)) = self.node.as_mut()
                    && let Some(hook) = listener_hook(e)
                {
                    node.listeners.push(hook);
                }
            }
            "field" => {
                if let Some(field_name) = attr(e, "name") {
                    let value = attr(e, "stringValue")
                        .or_else(|| attr(e, "expression"))
                        .unwrap_or_default();
                    if empty {
                        self.push_field(field_name, value);
                    } else {
                        self.field = Some((field_name, value));
                    }
                }
            }
            "string" | "expression" if self.field.is_some() && !empty => {
                self.capture = Some(Capture::FieldValue);
                self.text.clear();
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: &str) {
        match name {
            "process" => {
                if let Some(graph) = self.process.take() {
                    self.graphs.push(graph);
                }
            }
            "sequenceFlow" => {
                if let Some(flow) = self.flow.take() {
                    self.push_flow(flow);
                }
            }
            "conditionExpression" if self.capture == Some(Capture::Condition) => {
                let guard = self.text.trim().to_string();
                if let Some(flow) = self.flow.as_mut()
                    && !guard.is_empty()
                {
                    flow.guard = Some(guard);
                }
                self.capture = None;
            }
            "string" | "expression" if self.capture == Some(Capture::FieldValue) => {
                if let Some((_, value)) = self.field.as_mut() {
                    *value = self.text.trim().to_string();
                }
                self.capture = None;
            }
            "field" => {
                if let Some((field_name, value)) = self.field.take() {
                    self.push_field(field_name, value);
                }
            }
            _ => {
                if self.node.as_ref().is_some_and(|(element, _)| element == name)
                    && let Some((_, node)) = self.node.take()
                {
                    self.push_node(node);
                }
            }
        }
    }

    fn text(&mut self, text: &str) {
        if self.capture.is_some() {
            self.text.push_str(text);
        }
    }

    fn push_node(&mut self, node: Node) {
        if let Some(process) = self.process.as_mut() {
            process.nodes.push(node);
        }
    }

    fn push_flow(&mut self, flow: Transition) {
        if let Some(process) = self.process.as_mut() {
            process.transitions.push(flow);
        }
    }

    fn push_field(&mut self, field_name: String, value: String) {
        if let Some((_, node)) = self.node.as_mut()
            && let NodeKind::ServiceStep { fields, .. } = &mut node.kind
        {
            fields.insert(field_name, value);
        }
    }
}

fn node_kind(element: &str, e: &BytesStart<'_>) -> Option<NodeKind> {
    match element {
        "startEvent" => Some(NodeKind::Start),
        "endEvent" => Some(NodeKind::End),
        "userTask" => Some(NodeKind::UserTask {
            assignee: attr(e, "assignee"),
            candidate_users: attr(e, "candidateUsers").into_iter().collect(),
        }),
        "exclusiveGateway" => Some(NodeKind::ExclusiveGateway {
            default: attr(e, "default"),
        }),
        "serviceTask" => {
            let implementation = ["class", "delegateExpression", "expression", "implementation"]
                .iter()
                .filter_map(|a| attr(e, a))
                .find(|v| !v.starts_with("##"))
                .map(|v| strip_expression(&v));
            Some(NodeKind::ServiceStep {
                implementation,
                fields: BTreeMap::new(),
            })
        }
        _ => None,
    }
}

fn listener_hook(e: &BytesStart<'_>) -> Option<ListenerHook> {
    let phase = match attr(e, "event").as_deref().unwrap_or("start") {
        "start" | "preEntry" => ListenerPhase::PreEntry,
        "postEntry" => ListenerPhase::PostEntry,
        "end" | "preExit" => ListenerPhase::PreExit,
        _ => return None,
    };
    let listener = attr(e, "class")
        .or_else(|| attr(e, "delegateExpression"))
        .or_else(|| attr(e, "expression"))?;
    Some(ListenerHook {
        phase,
        listener: strip_expression(&listener),
    })
}

/// `${name}` → `name`; anything else unchanged.
fn strip_expression(value: &str) -> String {
    let v = value.trim();
    v.strip_prefix("${")
        .or_else(|| v.strip_prefix("#{"))
        .and_then(|rest| rest.strip_suffix('}'))
        .map(|inner| inner.trim().to_string())
        .unwrap_or_else(|| v.to_string())
}

/// Look up an attribute by local name, ignoring any namespace prefix.
fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name.as_bytes())
        .map(|a| match a.unescape_value() {
            Ok(value) => value.into_owned(),
            Err(_) => String::from_utf8_lossy(&a.value).into_owned(),
        })
}

/// Expand `&name;` or `&#NN;` found in element text.
fn resolve_reference(e: &BytesRef<'_>, resource: &str) -> Result<String> {
    let bad = |detail: String| EngineError::PackageFormat(format!("{} in '{}'", detail, resource));
    if let Some(c) = e
        .resolve_char_ref()
        .map_err(|err| bad(format!("invalid character reference: {}", err)))?
    {
        return Ok(c.to_string());
    }
    let name = e
        .decode()
        .map_err(|err| bad(format!("invalid entity reference: {}", err)))?;
    resolve_predefined_entity(&name)
        .map(str::to_string)
        .ok_or_else(|| bad(format!("unknown entity '&{};'", name)))
}
