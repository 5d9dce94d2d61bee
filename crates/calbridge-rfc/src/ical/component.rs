//! Component/property tree for iCalendar documents.

/// A property parameter, e.g. `TZID=Europe/Berlin`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

impl Parameter {
    #[must_use]
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            value: value.to_string(),
        }
    }

    #[must_use]
    pub fn tzid(value: &str) -> Self {
        Self::new("TZID", value)
    }
}

/// A content line: name, parameters, and the raw (unescaped-on-read) value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub params: Vec<Parameter>,
    pub value: String,
}

impl Property {
    #[must_use]
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            params: Vec::new(),
            value: value.to_string(),
        }
    }

    #[must_use]
    pub fn with_params(name: &str, params: Vec<Parameter>, value: &str) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            params,
            value: value.to_string(),
        }
    }

    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_str())
    }
}

/// An iCalendar component (VCALENDAR, VEVENT, VTIMEZONE, ...)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Component {
    pub name: String,
    pub properties: Vec<Property>,
    pub children: Vec<Component>,
}

impl Component {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            properties: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn add_property(&mut self, property: Property) {
        self.properties.push(property);
    }

    pub fn add_child(&mut self, child: Component) {
        self.children.push(child);
    }

    #[must_use]
    pub fn get_property(&self, name: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn get_properties(&self, name: &str) -> Vec<&Property> {
        self.properties
            .iter()
            .filter(|p| p.name.eq_ignore_ascii_case(name))
            .collect()
    }

    /// Replaces every instance of `name` with a single property
    pub fn set_property(&mut self, property: Property) {
        self.properties
            .retain(|p| !p.name.eq_ignore_ascii_case(&property.name));
        self.properties.push(property);
    }

    /// First child with the given component name, depth 1
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Component> {
        self.children
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn child_mut(&mut self, name: &str) -> Option<&mut Component> {
        self.children
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// All children with the given name, depth 1
    #[must_use]
    pub fn children_named(&self, name: &str) -> Vec<&Component> {
        self.children
            .iter()
            .filter(|c| c.name.eq_ignore_ascii_case(name))
            .collect()
    }
}
