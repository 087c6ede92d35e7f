//! Space and AppTree conventions over the tree engine.
//!
//! A space is a RepTree whose root is named `space` and carries four
//! named children: `app-configs`, `app-forest`, `providers`, `settings`.
//! Each application's state lives in its own satellite RepTree (an
//! AppTree), referenced from `app-forest` by a `tid` property.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use grove_core::{PeerId, PropertyValue, RepTree, VertexId, NAME_KEY};

use crate::error::SpaceError;
use crate::secrets::SecretMap;

pub const SPACE_NAME: &str = "space";
pub const APP_CONFIGS: &str = "app-configs";
pub const APP_FOREST: &str = "app-forest";
pub const PROVIDERS: &str = "providers";
pub const SETTINGS: &str = "settings";

pub const APP_TREE_NAME: &str = "app-tree";
pub const MESSAGES: &str = "messages";
pub const JOBS: &str = "jobs";

/// Property keys used by the space conventions and the chat boundary.
pub mod keys {
    pub const VERSION: &str = "version";
    pub const CREATED_AT: &str = "createdAt";
    pub const NAME: &str = "name";
    pub const NEEDS_SETUP: &str = "needsSetup";
    pub const APP_ID: &str = "appId";
    pub const TID: &str = "tid";
    pub const TITLE: &str = "title";

    pub const ROLE: &str = "role";
    pub const TEXT: &str = "text";
    pub const IN_PROGRESS: &str = "inProgress";
    pub const THINKING: &str = "thinking";
    pub const MAIN: &str = "main";
}

/// App-config vertex projection (reserved keys per the protocol
/// boundary).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(rename = "targetLLM", default, skip_serializing_if = "Option::is_none")]
    pub target_llm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button: Option<String>,
}

/// A satellite tree owned by one application.
pub struct AppTree {
    tree: RepTree,
}

impl AppTree {
    /// Bootstrap a new app tree: root `{_n:"app-tree", appId, createdAt}`
    /// plus the two standard containers, `messages` and `jobs`.
    pub fn create(peer: PeerId, app_id: &str) -> Result<Self, SpaceError> {
        let mut tree = RepTree::new(peer);
        let root = tree.new_vertex(
            None,
            vec![
                (NAME_KEY.into(), APP_TREE_NAME.into()),
                (keys::APP_ID.into(), app_id.into()),
            ],
        )?;
        tree.new_vertex(Some(&root), vec![(NAME_KEY.into(), MESSAGES.into())])?;
        tree.new_vertex(Some(&root), vec![(NAME_KEY.into(), JOBS.into())])?;
        Ok(Self { tree })
    }

    pub fn from_tree(tree: RepTree) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &RepTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut RepTree {
        &mut self.tree
    }

    pub fn root_id(&self) -> Option<VertexId> {
        self.tree.root_vertex_id()
    }

    pub fn app_id(&self) -> Option<String> {
        let root = self.root_id()?;
        self.tree
            .store()
            .property_value(&root, keys::APP_ID)
            .and_then(PropertyValue::as_str)
            .map(str::to_string)
    }

    pub fn named_child(&self, name: &str) -> Option<VertexId> {
        let root = self.root_id()?;
        named_child_of(&self.tree, &root, name)
    }
}

type TreeLoader = Box<dyn FnMut(&VertexId) -> Option<RepTree> + Send>;
type TreeObserver = Box<dyn FnMut(&VertexId) + Send>;

/// The user's workspace: one space tree plus its loaded app trees and
/// the in-memory secret map.
pub struct Space {
    tree: RepTree,
    app_trees: HashMap<VertexId, AppTree>,
    tree_loader: Option<TreeLoader>,
    secrets: SecretMap,
    created_observers: Vec<(u64, TreeObserver)>,
    loaded_observers: Vec<(u64, TreeObserver)>,
    next_observer: u64,
}

impl Space {
    /// Bootstrap a new space. The ops this emits are the genesis list;
    /// they merge cleanly into any replica of the same space.
    pub fn create(peer: PeerId) -> Result<Self, SpaceError> {
        let mut tree = RepTree::new(peer);
        let root = tree.new_vertex(
            None,
            vec![
                (NAME_KEY.into(), SPACE_NAME.into()),
                (keys::VERSION.into(), 1i64.into()),
                (keys::NAME.into(), "New space".into()),
            ],
        )?;
        for name in [APP_CONFIGS, APP_FOREST, PROVIDERS, SETTINGS] {
            tree.new_vertex(Some(&root), vec![(NAME_KEY.into(), name.into())])?;
        }

        let mut space = Self::from_tree(tree);
        space.add_app_config(&AppConfig {
            id: "default".into(),
            name: "Assistant".into(),
            description: Some("A helpful assistant".into()),
            instructions: None,
            target_llm: None,
            button: Some("New chat".into()),
        })?;
        Ok(space)
    }

    pub fn from_tree(tree: RepTree) -> Self {
        Self {
            tree,
            app_trees: HashMap::new(),
            tree_loader: None,
            secrets: SecretMap::new(),
            created_observers: Vec::new(),
            loaded_observers: Vec::new(),
            next_observer: 0,
        }
    }

    pub fn tree(&self) -> &RepTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut RepTree {
        &mut self.tree
    }

    /// The space id is its tree's root vertex id.
    pub fn id(&self) -> Option<VertexId> {
        self.tree.root_vertex_id()
    }

    /// Root named `space`, with `app-configs` and `app-forest` present.
    pub fn is_valid(&self) -> bool {
        let Some(root) = self.tree.root_vertex_id() else {
            return false;
        };
        self.tree.store().name(&root) == Some(SPACE_NAME)
            && named_child_of(&self.tree, &root, APP_CONFIGS).is_some()
            && named_child_of(&self.tree, &root, APP_FOREST).is_some()
    }

    pub fn named_child(&self, name: &str) -> Option<VertexId> {
        let root = self.tree.root_vertex_id()?;
        named_child_of(&self.tree, &root, name)
    }

    fn require_named_child(&self, name: &'static str) -> Result<VertexId, SpaceError> {
        self.named_child(name)
            .ok_or(SpaceError::MissingSpaceVertex { name })
    }

    // -------------------------------------------------------------------
    // App trees
    // -------------------------------------------------------------------

    /// Create an app tree and its `app-forest` reference vertex.
    /// Returns the new tree's root id (`tid`).
    pub fn new_app_tree(&mut self, app_id: &str) -> Result<VertexId, SpaceError> {
        let forest = self.require_named_child(APP_FOREST)?;
        let app_tree = AppTree::create(self.tree.peer_id().clone(), app_id)?;
        let tid = app_tree
            .root_id()
            .ok_or(SpaceError::MissingSpaceVertex { name: APP_TREE_NAME })?;

        self.tree.new_vertex(
            Some(&forest),
            vec![(keys::TID.into(), tid.as_str().into())],
        )?;
        self.app_trees.insert(tid.clone(), app_tree);
        self.notify(NotifyList::Created, &tid);
        Ok(tid)
    }

    /// Memoized lookup; a miss goes through the injected loader.
    pub fn load_app_tree(&mut self, id: &VertexId) -> Option<&mut AppTree> {
        if !self.app_trees.contains_key(id) {
            let mut loader = self.tree_loader.take()?;
            let loaded = loader(id);
            self.tree_loader = Some(loader);
            let tree = loaded?;
            self.app_trees.insert(id.clone(), AppTree::from_tree(tree));
            self.notify(NotifyList::Loaded, id);
        }
        self.app_trees.get_mut(id)
    }

    pub fn app_tree(&self, id: &VertexId) -> Option<&AppTree> {
        self.app_trees.get(id)
    }

    pub fn app_tree_mut(&mut self, id: &VertexId) -> Option<&mut AppTree> {
        self.app_trees.get_mut(id)
    }

    pub fn loaded_tree_ids(&self) -> impl Iterator<Item = &VertexId> {
        self.app_trees.keys()
    }

    /// The persistence layer injects how satellite trees come off disk.
    pub fn set_tree_loader(
        &mut self,
        loader: impl FnMut(&VertexId) -> Option<RepTree> + Send + 'static,
    ) {
        self.tree_loader = Some(Box::new(loader));
    }

    pub fn on_app_tree_created(&mut self, observer: impl FnMut(&VertexId) + Send + 'static) -> u64 {
        let handle = self.next_observer;
        self.next_observer += 1;
        self.created_observers.push((handle, Box::new(observer)));
        handle
    }

    pub fn on_app_tree_loaded(&mut self, observer: impl FnMut(&VertexId) + Send + 'static) -> u64 {
        let handle = self.next_observer;
        self.next_observer += 1;
        self.loaded_observers.push((handle, Box::new(observer)));
        handle
    }

    pub fn remove_tree_observer(&mut self, handle: u64) {
        self.created_observers.retain(|(h, _)| *h != handle);
        self.loaded_observers.retain(|(h, _)| *h != handle);
    }

    fn notify(&mut self, list: NotifyList, id: &VertexId) {
        let observers = match list {
            NotifyList::Created => &mut self.created_observers,
            NotifyList::Loaded => &mut self.loaded_observers,
        };
        for (_, observer) in observers.iter_mut() {
            observer(id);
        }
    }

    // -------------------------------------------------------------------
    // App configs
    // -------------------------------------------------------------------

    pub fn add_app_config(&mut self, config: &AppConfig) -> Result<VertexId, SpaceError> {
        let configs = self.require_named_child(APP_CONFIGS)?;
        let mut props: Vec<(String, PropertyValue)> = vec![
            ("id".into(), config.id.as_str().into()),
            ("name".into(), config.name.as_str().into()),
        ];
        for (key, value) in [
            ("description", &config.description),
            ("instructions", &config.instructions),
            ("targetLLM", &config.target_llm),
            ("button", &config.button),
        ] {
            if let Some(value) = value {
                props.push((key.into(), value.as_str().into()));
            }
        }
        Ok(self.tree.new_vertex(Some(&configs), props)?)
    }

    pub fn app_configs(&self) -> Vec<AppConfig> {
        let Some(configs) = self.named_child(APP_CONFIGS) else {
            return Vec::new();
        };
        self.tree
            .store()
            .children(&configs)
            .iter()
            .filter_map(|id| self.tree.vertex(id)?.to_typed::<AppConfig>().ok())
            .collect()
    }

    // -------------------------------------------------------------------
    // Secrets (memory only; persisted as a separate encrypted blob)
    // -------------------------------------------------------------------

    pub fn secrets(&self) -> &SecretMap {
        &self.secrets
    }

    pub fn secret(&self, key: &str) -> Option<&str> {
        self.secrets.get(key).map(String::as_str)
    }

    pub fn set_secret(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.secrets.insert(key.into(), value.into());
    }

    pub fn replace_secrets(&mut self, secrets: SecretMap) {
        self.secrets = secrets;
    }
}

enum NotifyList {
    Created,
    Loaded,
}

fn named_child_of(tree: &RepTree, parent: &VertexId, name: &str) -> Option<VertexId> {
    tree.store()
        .children(parent)
        .iter()
        .find(|c| tree.store().name(c) == Some(name))
        .cloned()
}
