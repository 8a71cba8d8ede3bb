use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::InstallError;
use crate::package::Package;

/// Packages of one installation and their "needs installed first" edges.
///
/// Node order is declaration order (dependencies as listed, root last) and
/// breaks ties wherever more than one package is ready.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<Package>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build the graph, merging identical duplicates. Two entries with the
    /// same name and different hashes, or a dependency on a name that is not
    /// in the set, are conflicts.
    pub fn build(root: Package, dependencies: Vec<Package>) -> Result<Self, InstallError> {
        let mut graph = DependencyGraph {
            nodes: Vec::with_capacity(dependencies.len() + 1),
            index: HashMap::new(),
        };

        let root_name = root.name.clone();
        for dep in dependencies {
            if dep.name == root_name && dep.hash != root.hash {
                return Err(duplicate_conflict(&root, &dep));
            }
            if dep.name == root_name {
                continue;
            }
            graph.insert(dep)?;
        }
        graph.insert(root)?;

        for node in &graph.nodes {
            if let Some(missing) = node
                .dependencies
                .iter()
                .find(|d| !graph.index.contains_key(*d))
            {
                return Err(InstallError::conflict(
                    &node.name,
                    format!("depends on '{}', which is not part of the installation", missing),
                ));
            }
        }
        Ok(graph)
    }

    fn insert(&mut self, package: Package) -> Result<(), InstallError> {
        match self.index.get(&package.name) {
            Some(&i) => {
                let existing = &mut self.nodes[i];
                if existing.hash != package.hash {
                    return Err(duplicate_conflict(existing, &package));
                }
                for dep in package.dependencies {
                    if !existing.dependencies.contains(&dep) {
                        existing.dependencies.push(dep);
                    }
                }
            }
            None => {
                let mut package = package;
                let mut seen = HashSet::new();
                package.dependencies.retain(|d| seen.insert(d.clone()));
                self.index.insert(package.name.clone(), self.nodes.len());
                self.nodes.push(package);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn packages(&self) -> &[Package] {
        &self.nodes
    }

    pub fn package(&self, name: &str) -> Option<&Package> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.package(name)
            .map(|p| p.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Names of the packages that depend directly on `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.dependencies.iter().any(|d| d == name))
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Every package after all of its dependencies (Kahn's algorithm).
    pub fn install_order(&self) -> Result<Vec<&Package>, InstallError> {
        Ok(self
            .layers()?
            .into_iter()
            .flatten()
            .collect())
    }

    /// Groups of packages with no edges between them; each group only
    /// depends on earlier groups.
    pub fn layers(&self) -> Result<Vec<Vec<&Package>>, InstallError> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let dependents: Vec<Vec<usize>> = self
            .nodes
            .iter()
            .map(|n| {
                self.dependents_of(&n.name)
                    .iter()
                    .map(|d| self.index[*d])
                    .collect()
            })
            .collect();

        let mut ready: BTreeSet<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut layers = Vec::new();
        let mut placed = 0;

        while !ready.is_empty() {
            let layer: Vec<usize> = std::mem::take(&mut ready).into_iter().collect();
            for &i in &layer {
                for &j in &dependents[i] {
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        ready.insert(j);
                    }
                }
            }
            placed += layer.len();
            layers.push(layer.into_iter().map(|i| &self.nodes[i]).collect());
        }

        if placed < self.nodes.len() {
            return Err(InstallError::Cycle {
                cycle: self.find_cycle(&in_degree),
            });
        }
        Ok(layers)
    }

    /// Walk unresolved dependency edges from the first unplaced node until a
    /// node repeats. Every unplaced node has an unplaced dependency, so the
    /// walk always closes a cycle. The closing node is not repeated.
    fn find_cycle(&self, in_degree: &[usize]) -> Vec<String> {
        let unplaced = |i: usize| in_degree[i] > 0;
        let Some(start) = (0..self.nodes.len()).find(|&i| unplaced(i)) else {
            return Vec::new();
        };

        let mut path: Vec<usize> = vec![start];
        let mut current = start;
        loop {
            let next = self.nodes[current]
                .dependencies
                .iter()
                .map(|d| self.index[d])
                .find(|&j| unplaced(j));
            let Some(next) = next else {
                break;
            };
            if let Some(pos) = path.iter().position(|&p| p == next) {
                return path[pos..]
                    .iter()
                    .map(|&i| self.nodes[i].name.clone())
                    .collect();
            }
            path.push(next);
            current = next;
        }
        path.iter().map(|&i| self.nodes[i].name.clone()).collect()
    }
}

fn duplicate_conflict(a: &Package, b: &Package) -> InstallError {
    InstallError::conflict(
        &a.name,
        format!("declared with hash {} and with hash {}", a.hash, b.hash),
    )
}
