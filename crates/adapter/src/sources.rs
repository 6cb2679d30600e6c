//! The source model: compiled sources as the runtime reports them, authored
//! sources discovered through source maps, and the reference counting that
//! ties their lifetimes together.
//!
//! A source map is keyed by URL and shared by every compiled source pointing
//! at it. Loading is collapsed: concurrent attachers wait on the same fetch,
//! and a completion that arrives after the last attacher detached is ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use jsdbg_dap::types::Source as DapSource;

use crate::error::AdapterError;
use crate::ids;
use crate::overrides::PathOverrides;
use crate::sourcemap::{resolve_authored_url, SourceMap};

pub type ContentGetter =
    Arc<dyn Fn() -> BoxFuture<'static, Result<String, AdapterError>> + Send + Sync>;

#[derive(Clone, Debug)]
pub enum SourceEvent {
    Added(DapSource),
    Removed(Vec<DapSource>),
}

/// Location in a compiled script, zero-based.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceLocation {
    pub url: String,
    pub line: u32,
    pub column: u32,
}

/// Location after source-map resolution. `authored` is false when the raw
/// compiled location was returned unchanged.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedLocation {
    pub url: String,
    pub line: u32,
    pub column: u32,
    pub source_ref: Option<u64>,
    pub authored: bool,
}

pub struct CompiledSource {
    pub source_ref: u64,
    pub url: String,
    pub mime: String,
}

struct CompiledEntry {
    source: Arc<CompiledSource>,
    content: ContentGetter,
    map_url: Option<String>,
}

struct AuthoredEntry {
    source_ref: u64,
    resolved_url: String,
    content: Option<String>,
    ref_count: u32,
}

enum MapState {
    Loading,
    Loaded(Arc<SourceMap>),
    Failed,
}

struct MapEntry {
    state: MapState,
    /// Compiled source refs currently pointing at this map URL.
    attached: HashSet<u64>,
}

#[derive(Default)]
struct Inner {
    compiled: HashMap<u64, CompiledEntry>,
    compiled_by_url: HashMap<String, u64>,
    authored: HashMap<String, AuthoredEntry>,
    authored_refs: HashMap<u64, String>,
    maps: HashMap<String, MapEntry>,
}

pub struct SourceContainer {
    inner: Mutex<Inner>,
    overrides: RwLock<PathOverrides>,
    events: broadcast::Sender<SourceEvent>,
}

impl SourceContainer {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            overrides: RwLock::new(PathOverrides::empty()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    pub fn set_overrides(&self, overrides: PathOverrides) {
        *self.overrides.write() = overrides;
    }

    /// Register a script the runtime just parsed.
    pub fn add_compiled(&self, url: &str, content: ContentGetter) -> Arc<CompiledSource> {
        let source = Arc::new(CompiledSource {
            source_ref: ids::next_source_ref(),
            url: url.to_string(),
            mime: "text/javascript".to_string(),
        });
        {
            let mut inner = self.inner.lock();
            inner.compiled.insert(
                source.source_ref,
                CompiledEntry {
                    source: Arc::clone(&source),
                    content,
                    map_url: None,
                },
            );
            if !url.is_empty() {
                inner
                    .compiled_by_url
                    .insert(url.to_string(), source.source_ref);
            }
        }
        let _ = self
            .events
            .send(SourceEvent::Added(self.dap_source_for_ref(source.source_ref).unwrap_or_default()));
        source
    }

    /// Point a compiled source at a source map URL, replacing any previous
    /// one on that compiled source. Shares the pending-or-loaded map with
    /// every other compiled source using the same URL. Returns the compiled
    /// source's URL when this attach is the one that must fetch the map.
    pub fn register_source_map(&self, compiled_ref: u64, map_url: &str) -> Option<String> {
        enum Attach {
            Load(String),
            FanOut(Arc<SourceMap>),
            Nothing,
        }

        let action = {
            let mut inner = self.inner.lock();
            let (compiled_url, previous) = match inner.compiled.get(&compiled_ref) {
                Some(entry) => (entry.source.url.clone(), entry.map_url.clone()),
                None => return None,
            };
            if let Some(previous) = previous {
                if previous == map_url {
                    return None;
                }
                self.detach_map_locked(&mut inner, compiled_ref, &previous);
            }
            if let Some(entry) = inner.compiled.get_mut(&compiled_ref) {
                entry.map_url = Some(map_url.to_string());
            }

            let action = {
                let map = inner.maps.entry(map_url.to_string()).or_insert(MapEntry {
                    state: MapState::Loading,
                    attached: HashSet::new(),
                });
                map.attached.insert(compiled_ref);
                match &map.state {
                    MapState::Loading if map.attached.len() == 1 => Attach::Load(compiled_url),
                    MapState::Loading => Attach::Nothing,
                    MapState::Loaded(map) => Attach::FanOut(Arc::clone(map)),
                    MapState::Failed => Attach::Nothing,
                }
            };
            match action {
                Attach::FanOut(map) => {
                    let events = self.fan_out_locked(&mut inner, compiled_ref, map_url, &map);
                    drop(inner);
                    self.publish(events);
                    return None;
                }
                other => other,
            }
        };

        match action {
            Attach::Load(compiled_url) => Some(compiled_url),
            _ => None,
        }
    }

    /// Register and fetch in one step; the path used for runtime-reported
    /// `sourceMappingURL`s.
    pub async fn attach_source_map(self: &Arc<Self>, compiled_ref: u64, map_url: &str) {
        if let Some(compiled_url) = self.register_source_map(compiled_ref, map_url) {
            let content = fetch_map_content(map_url, &compiled_url).await;
            self.complete_map_load(map_url, content);
        }
    }

    /// Resolution of a finished (or failed) source-map fetch. Fans authored
    /// sources out to every compiled source still pointing at the URL.
    pub fn complete_map_load(&self, map_url: &str, content: Result<String, AdapterError>) {
        let parsed = content.and_then(|text| SourceMap::parse(&text));
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            let loaded = {
                let Some(entry) = inner.maps.get_mut(map_url) else {
                    // Every attacher detached while the fetch was in flight.
                    debug!(target: "adapter", map = %map_url, "source map completion ignored");
                    return;
                };
                if !matches!(entry.state, MapState::Loading) {
                    return;
                }
                match parsed {
                    Ok(map) => {
                        let map = Arc::new(map);
                        entry.state = MapState::Loaded(Arc::clone(&map));
                        Some((map, entry.attached.iter().copied().collect::<Vec<u64>>()))
                    }
                    Err(err) => {
                        // Recorded on the map; locations fall back to raw.
                        warn!(target: "adapter", map = %map_url, %err, "source map load failed");
                        entry.state = MapState::Failed;
                        None
                    }
                }
            };
            if let Some((map, attached)) = loaded {
                for compiled_ref in attached {
                    events.extend(self.fan_out_locked(&mut inner, compiled_ref, map_url, &map));
                }
            }
        }
        self.publish(events);
    }

    fn fan_out_locked(
        &self,
        inner: &mut Inner,
        compiled_ref: u64,
        map_url: &str,
        map: &SourceMap,
    ) -> Vec<SourceEvent> {
        let compiled_url = match inner.compiled.get(&compiled_ref) {
            Some(compiled) => compiled.source.url.clone(),
            None => return Vec::new(),
        };
        let mut events = Vec::new();
        for (index, source) in map.sources().iter().enumerate() {
            let resolved = resolve_authored_url(map_url, &compiled_url, source);
            let entry = inner
                .authored
                .entry(resolved.clone())
                .or_insert_with(|| AuthoredEntry {
                    source_ref: ids::next_source_ref(),
                    resolved_url: resolved.clone(),
                    content: map.embedded_content(index as u32).map(str::to_string),
                    ref_count: 0,
                });
            if entry.ref_count == 0 {
                inner
                    .authored_refs
                    .insert(entry.source_ref, resolved.clone());
                events.push(SourceEvent::Added(self.project_authored(entry)));
            }
            entry.ref_count += 1;
        }
        events
    }

    fn detach_map_locked(&self, inner: &mut Inner, compiled_ref: u64, map_url: &str) {
        let (loaded, orphaned) = {
            let Some(entry) = inner.maps.get_mut(map_url) else {
                return;
            };
            entry.attached.remove(&compiled_ref);
            let loaded = match &entry.state {
                MapState::Loaded(map) => Some(Arc::clone(map)),
                _ => None,
            };
            (loaded, entry.attached.is_empty())
        };
        if orphaned {
            inner.maps.remove(map_url);
        }

        let mut removed = Vec::new();
        if let Some(map) = loaded {
            let compiled_url = inner
                .compiled
                .get(&compiled_ref)
                .map(|c| c.source.url.clone())
                .unwrap_or_default();
            for source in map.sources() {
                let resolved = resolve_authored_url(map_url, &compiled_url, source);
                let emptied = match inner.authored.get_mut(&resolved) {
                    Some(authored) => {
                        authored.ref_count = authored.ref_count.saturating_sub(1);
                        authored.ref_count == 0
                    }
                    None => false,
                };
                if emptied {
                    if let Some(authored) = inner.authored.remove(&resolved) {
                        inner.authored_refs.remove(&authored.source_ref);
                        removed.push(self.project_authored(&authored));
                    }
                }
            }
        }
        if !removed.is_empty() {
            let _ = self.events.send(SourceEvent::Removed(removed));
        }
    }

    /// Drop compiled sources (a thread went away), releasing authored
    /// sources their maps were holding.
    pub fn remove_compiled(&self, refs: &[u64]) {
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.lock();
            for &compiled_ref in refs {
                if let Some(map_url) = inner
                    .compiled
                    .get(&compiled_ref)
                    .and_then(|entry| entry.map_url.clone())
                {
                    self.detach_map_locked(&mut inner, compiled_ref, &map_url);
                }
                if let Some(entry) = inner.compiled.remove(&compiled_ref) {
                    inner.compiled_by_url.remove(&entry.source.url);
                    removed.push(self.project_compiled(&entry.source));
                }
            }
        }
        if !removed.is_empty() {
            let _ = self.events.send(SourceEvent::Removed(removed));
        }
    }

    /// Map a compiled location onto its authored equivalent, or return it
    /// unchanged when no loaded map covers it.
    pub fn resolve(&self, location: &SourceLocation) -> ResolvedLocation {
        let raw = ResolvedLocation {
            url: location.url.clone(),
            line: location.line,
            column: location.column,
            source_ref: None,
            authored: false,
        };
        let inner = self.inner.lock();
        let Some(&compiled_ref) = inner.compiled_by_url.get(&location.url) else {
            return raw;
        };
        let Some(compiled) = inner.compiled.get(&compiled_ref) else {
            return raw;
        };
        let Some(map_url) = compiled.map_url.as_deref() else {
            return raw;
        };
        let Some(MapEntry {
            state: MapState::Loaded(map),
            ..
        }) = inner.maps.get(map_url)
        else {
            return raw;
        };
        let Some(entry) = map.lookup(location.line, location.column) else {
            return raw;
        };
        let Some(index) = entry.source_index else {
            return raw;
        };
        let Some(source) = map.source_url(index) else {
            return raw;
        };
        let resolved = resolve_authored_url(map_url, &compiled.source.url, source);
        let source_ref = inner
            .authored
            .get(&resolved)
            .map(|authored| authored.source_ref);
        ResolvedLocation {
            url: resolved,
            line: entry.source_line,
            column: entry.source_column,
            source_ref,
            authored: true,
        }
    }

    /// All compiled and authored sources, projected for `loadedSources`.
    pub fn loaded_sources(&self) -> Vec<DapSource> {
        let inner = self.inner.lock();
        let mut sources: Vec<DapSource> = inner
            .compiled
            .values()
            .map(|entry| self.project_compiled(&entry.source))
            .collect();
        sources.extend(
            inner
                .authored
                .values()
                .map(|authored| self.project_authored(authored)),
        );
        sources.sort_by(|a, b| a.source_reference.cmp(&b.source_reference));
        sources
    }

    pub fn dap_source_for_ref(&self, source_ref: u64) -> Option<DapSource> {
        let inner = self.inner.lock();
        if let Some(entry) = inner.compiled.get(&source_ref) {
            return Some(self.project_compiled(&entry.source));
        }
        inner
            .authored_refs
            .get(&source_ref)
            .and_then(|url| inner.authored.get(url))
            .map(|authored| self.project_authored(authored))
    }

    /// Content for the `source` request, with its mime type.
    pub async fn content(&self, source_ref: u64) -> Result<(String, String), AdapterError> {
        enum Fetch {
            Getter(ContentGetter),
            Inline(String),
            File(String),
        }

        let fetch = {
            let inner = self.inner.lock();
            if let Some(entry) = inner.compiled.get(&source_ref) {
                Fetch::Getter(Arc::clone(&entry.content))
            } else if let Some(authored) = inner
                .authored_refs
                .get(&source_ref)
                .and_then(|url| inner.authored.get(url))
            {
                match &authored.content {
                    Some(content) => Fetch::Inline(content.clone()),
                    None => Fetch::File(strip_file_scheme(&authored.resolved_url)),
                }
            } else {
                return Err(AdapterError::UnknownSource(source_ref));
            }
        };
        let content = match fetch {
            Fetch::Getter(getter) => getter().await?,
            Fetch::Inline(content) => content,
            Fetch::File(path) => tokio::fs::read_to_string(&path).await?,
        };
        Ok((content, "text/javascript".to_string()))
    }

    pub fn authored_ref_count(&self, resolved_url: &str) -> u32 {
        self.inner
            .lock()
            .authored
            .get(resolved_url)
            .map(|authored| authored.ref_count)
            .unwrap_or(0)
    }

    /// Project an authored location for a DAP `source` field; path overrides
    /// apply only here.
    fn project_authored(&self, authored: &AuthoredEntry) -> DapSource {
        let rewritten = self.overrides.read().apply(&authored.resolved_url);
        let path = strip_file_scheme(&rewritten);
        let is_path = path.starts_with('/')
            || (path.len() > 2 && path.as_bytes()[1] == b':');
        DapSource {
            name: Some(basename(&path)),
            path: is_path.then(|| path.clone()),
            source_reference: if is_path && authored.content.is_none() {
                None
            } else {
                Some(authored.source_ref)
            },
        }
    }

    fn project_compiled(&self, source: &CompiledSource) -> DapSource {
        DapSource {
            name: Some(basename(&source.url)),
            path: None,
            source_reference: Some(source.source_ref),
        }
    }

    fn publish(&self, events: Vec<SourceEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }
}

fn basename(url: &str) -> String {
    url.rsplit(['/', '\\'])
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(url)
        .to_string()
}

fn strip_file_scheme(url: &str) -> String {
    url.strip_prefix("file://")
        .map(str::to_string)
        .unwrap_or_else(|| url.to_string())
}

/// Fetch source-map bytes: inline `data:` URLs, local files, or HTTP(S).
async fn fetch_map_content(map_url: &str, compiled_url: &str) -> Result<String, AdapterError> {
    if let Some(rest) = map_url.strip_prefix("data:") {
        let Some((_, payload)) = rest.split_once(";base64,") else {
            return rest
                .split_once(',')
                .map(|(_, text)| text.to_string())
                .ok_or_else(|| AdapterError::SourceMap("unsupported data: url".into()));
        };
        let bytes = BASE64
            .decode(payload)
            .map_err(|err| AdapterError::SourceMap(err.to_string()))?;
        return String::from_utf8(bytes).map_err(|err| AdapterError::SourceMap(err.to_string()));
    }

    let absolute = if map_url.contains("://") {
        map_url.to_string()
    } else {
        // Relative map URL: resolve against the compiled script.
        resolve_authored_url(compiled_url, compiled_url, map_url)
    };

    if let Some(path) = absolute.strip_prefix("file://") {
        return Ok(tokio::fs::read_to_string(path).await?);
    }
    if absolute.starts_with("http://") || absolute.starts_with("https://") {
        let response = reqwest::get(&absolute)
            .await
            .map_err(|err| AdapterError::SourceMap(err.to_string()))?;
        return response
            .text()
            .await
            .map_err(|err| AdapterError::SourceMap(err.to_string()));
    }
    Ok(tokio::fs::read_to_string(&absolute).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn getter(text: &str) -> ContentGetter {
        let text = text.to_string();
        Arc::new(move || {
            let text = text.clone();
            Box::pin(async move { Ok(text) })
        })
    }

    fn map_text(sources: &[&str]) -> String {
        json!({"version": 3, "sources": sources, "mappings": "AAAA"}).to_string()
    }

    #[tokio::test]
    async fn authored_sources_are_ref_counted_across_compiled_sources() {
        let container = SourceContainer::new();
        let a = container.add_compiled("http://app/a.js", getter("a"));
        let b = container.add_compiled("http://app/b.js", getter("b"));

        assert!(container
            .register_source_map(a.source_ref, "http://app/a.js.map")
            .is_some());
        container.complete_map_load(
            "http://app/a.js.map",
            Ok(map_text(&["/src/shared.ts"])),
        );
        assert!(container
            .register_source_map(b.source_ref, "http://app/b.js.map")
            .is_some());
        container.complete_map_load(
            "http://app/b.js.map",
            Ok(map_text(&["/src/shared.ts"])),
        );

        assert_eq!(container.authored_ref_count("file:///src/shared.ts"), 2);

        container.remove_compiled(&[a.source_ref]);
        assert_eq!(container.authored_ref_count("file:///src/shared.ts"), 1);
        container.remove_compiled(&[b.source_ref]);
        assert_eq!(container.authored_ref_count("file:///src/shared.ts"), 0);
        assert!(container
            .loaded_sources()
            .iter()
            .all(|source| source.name.as_deref() != Some("shared.ts")));
    }

    #[tokio::test]
    async fn a_loaded_map_is_shared_by_url() {
        let container = SourceContainer::new();
        let a = container.add_compiled("http://app/a.js", getter("a"));
        let b = container.add_compiled("http://app/b.js", getter("b"));

        assert!(container
            .register_source_map(a.source_ref, "http://app/common.map")
            .is_some());
        // The second attacher shares the in-flight load.
        assert!(container
            .register_source_map(b.source_ref, "http://app/common.map")
            .is_none());
        container.complete_map_load("http://app/common.map", Ok(map_text(&["/src/one.ts"])));

        // Both attachers shared the single load; each contributed one ref.
        assert_eq!(container.authored_ref_count("file:///src/one.ts"), 2);
    }

    #[tokio::test]
    async fn completion_after_detach_is_ignored() {
        let container = SourceContainer::new();
        let a = container.add_compiled("http://app/a.js", getter("a"));
        container.register_source_map(a.source_ref, "http://app/a.js.map");
        container.remove_compiled(&[a.source_ref]);
        container.complete_map_load("http://app/a.js.map", Ok(map_text(&["/src/late.ts"])));
        assert_eq!(container.authored_ref_count("file:///src/late.ts"), 0);
    }

    #[tokio::test]
    async fn failed_map_falls_back_to_raw_locations() {
        let container = SourceContainer::new();
        let a = container.add_compiled("http://app/a.js", getter("a"));
        container.register_source_map(a.source_ref, "http://app/a.js.map");
        container.complete_map_load(
            "http://app/a.js.map",
            Err(AdapterError::SourceMap("404".into())),
        );

        let resolved = container.resolve(&SourceLocation {
            url: "http://app/a.js".into(),
            line: 3,
            column: 0,
        });
        assert!(!resolved.authored);
        assert_eq!(resolved.line, 3);
    }

    #[tokio::test]
    async fn resolve_maps_generated_locations_to_authored_ones() {
        let container = SourceContainer::new();
        let a = container.add_compiled("http://app/a.js", getter("a"));
        container.register_source_map(a.source_ref, "http://app/a.js.map");
        container.complete_map_load(
            "http://app/a.js.map",
            Ok(json!({
                "version": 3,
                "sources": ["/src/a.ts"],
                "mappings": "AAAA,IACE"
            })
            .to_string()),
        );

        let resolved = container.resolve(&SourceLocation {
            url: "http://app/a.js".into(),
            line: 0,
            column: 7,
        });
        assert!(resolved.authored);
        assert_eq!(resolved.url, "file:///src/a.ts");
        assert_eq!((resolved.line, resolved.column), (1, 2));
        assert!(resolved.source_ref.is_some());
    }

    #[tokio::test]
    async fn source_events_announce_additions_and_removals() {
        let container = SourceContainer::new();
        let mut events = container.subscribe();
        let a = container.add_compiled("http://app/a.js", getter("a"));
        assert!(matches!(
            events.recv().await.unwrap(),
            SourceEvent::Added(_)
        ));

        container.register_source_map(a.source_ref, "http://app/a.js.map");
        container.complete_map_load("http://app/a.js.map", Ok(map_text(&["/src/a.ts"])));
        let added = events.recv().await.unwrap();
        match added {
            SourceEvent::Added(source) => assert_eq!(source.name.as_deref(), Some("a.ts")),
            other => panic!("expected Added, got {other:?}"),
        }

        container.remove_compiled(&[a.source_ref]);
        let removed = events.recv().await.unwrap();
        match removed {
            SourceEvent::Removed(sources) => {
                assert!(sources.iter().any(|s| s.name.as_deref() == Some("a.ts")));
            }
            other => panic!("expected Removed, got {other:?}"),
        }
    }
}
