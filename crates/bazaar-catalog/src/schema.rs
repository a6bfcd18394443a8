use bazaar_core::{QueryCompiler, ID_FIELD, NAME_FIELD, SLUG_FIELD};

/// How a dependent collection stores its reference to a parent entity.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkKind {
    /// Embedded `{_id, ..fields}` copy of the parent at `path`.
    Snapshot { fields: Vec<String> },
    /// Array of bare parent ids at `path`.
    IdArray,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependentLink {
    pub collection: String,
    pub path: String,
    pub kind: LinkKind,
}

impl DependentLink {
    /// Snapshot link carrying the usual `name` and `slug` copy.
    pub fn snapshot(collection: &str, path: &str) -> Self {
        Self::snapshot_with(collection, path, &[NAME_FIELD, SLUG_FIELD])
    }

    pub fn snapshot_with(collection: &str, path: &str, fields: &[&str]) -> Self {
        Self {
            collection: collection.to_string(),
            path: path.to_string(),
            kind: LinkKind::Snapshot {
                fields: fields.iter().map(|f| f.to_string()).collect(),
            },
        }
    }

    pub fn id_array(collection: &str, path: &str) -> Self {
        Self {
            collection: collection.to_string(),
            path: path.to_string(),
            kind: LinkKind::IdArray,
        }
    }

    /// Path holding the parent id inside dependent documents.
    pub fn id_path(&self) -> String {
        match self.kind {
            LinkKind::Snapshot { .. } => format!("{}.{ID_FIELD}", self.path),
            LinkKind::IdArray => self.path.clone(),
        }
    }
}

/// Everything the generic services need to know about one entity type.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    /// Route name, e.g. `child-category`.
    pub name: String,
    pub collection: String,
    pub display_field: String,
    pub slugged: bool,
    pub reference_paths: Vec<String>,
    pub propagate_status: bool,
    pub dependents: Vec<DependentLink>,
}

impl EntitySchema {
    pub fn new(name: &str, collection: &str) -> Self {
        Self {
            name: name.to_string(),
            collection: collection.to_string(),
            display_field: NAME_FIELD.to_string(),
            slugged: true,
            reference_paths: Vec::new(),
            propagate_status: false,
            dependents: Vec::new(),
        }
    }

    pub fn display_field(mut self, field: &str) -> Self {
        self.display_field = field.to_string();
        self
    }

    pub fn without_slug(mut self) -> Self {
        self.slugged = false;
        self
    }

    pub fn reference(mut self, path: &str) -> Self {
        self.reference_paths.push(path.to_string());
        self
    }

    pub fn propagate_status(mut self) -> Self {
        self.propagate_status = true;
        self
    }

    pub fn dependent(mut self, link: DependentLink) -> Self {
        self.dependents.push(link);
        self
    }

    pub fn compiler(&self) -> QueryCompiler {
        QueryCompiler::new(self.display_field.clone())
            .with_reference_paths(self.reference_paths.iter().cloned())
    }

    /// Cascading deletes need a read-only fallback row only when some
    /// dependent embeds a snapshot; id arrays are simply pulled.
    pub fn needs_fallback(&self) -> bool {
        self.dependents
            .iter()
            .any(|l| matches!(l.kind, LinkKind::Snapshot { .. }))
    }

    /// Union of the fields any dependent copies from this entity.
    pub fn snapshot_fields(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for link in &self.dependents {
            if let LinkKind::Snapshot { fields } = &link.kind {
                for f in fields {
                    if !out.contains(f) {
                        out.push(f.clone());
                    }
                }
            }
        }
        out
    }
}

pub const CATEGORIES: &str = "categories";
pub const SUB_CATEGORIES: &str = "subCategories";
pub const CHILD_CATEGORIES: &str = "childCategories";
pub const BRANDS: &str = "brands";
pub const JOB_TYPES: &str = "jobTypes";
pub const SEO_PAGES: &str = "seoPages";
pub const MANAGEMENTS: &str = "managements";
pub const REWARDS: &str = "rewards";
pub const PRODUCTS: &str = "products";
pub const CONTACT_REQUESTS: &str = "contactRequests";

/// The classifieds marketplace entity set.
pub fn marketplace() -> Vec<EntitySchema> {
    vec![
        EntitySchema::new("category", CATEGORIES)
            .propagate_status()
            .dependent(DependentLink::snapshot(PRODUCTS, "category"))
            .dependent(DependentLink::snapshot(SUB_CATEGORIES, "category"))
            .dependent(DependentLink::snapshot(CHILD_CATEGORIES, "category")),
        EntitySchema::new("sub-category", SUB_CATEGORIES)
            .propagate_status()
            .dependent(DependentLink::snapshot(PRODUCTS, "subCategory"))
            .dependent(DependentLink::snapshot(CHILD_CATEGORIES, "subCategory")),
        EntitySchema::new("child-category", CHILD_CATEGORIES)
            .propagate_status()
            .dependent(DependentLink::snapshot(PRODUCTS, "childCategory")),
        EntitySchema::new("brand", BRANDS).dependent(DependentLink::snapshot(PRODUCTS, "brand")),
        EntitySchema::new("job-type", JOB_TYPES)
            .dependent(DependentLink::id_array(PRODUCTS, "jobTypes")),
        EntitySchema::new("seo-page", SEO_PAGES)
            .dependent(DependentLink::snapshot(PRODUCTS, "seoPage")),
        EntitySchema::new("management", MANAGEMENTS),
        EntitySchema::new("reward", REWARDS).without_slug(),
        EntitySchema::new("product", PRODUCTS)
            .reference("jobTypes")
            .dependent(DependentLink::snapshot(CONTACT_REQUESTS, "product")),
        EntitySchema::new("contact-request", CONTACT_REQUESTS)
            .without_slug()
            .display_field("user.name"),
    ]
}
