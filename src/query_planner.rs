use graphql_parser::query::Selection;
use std::collections::BTreeMap;
use tracing::trace;

use crate::{
    MergedTypeInfo, SubschemaId, TYPENAME_FIELD,
    merged_type::FieldOwners,
    selection::{Field, SelectionSet, selection_set},
};

/// One round of delegation. Every assignment within a stage is independent
/// of the others; a stage may only run once the previous one has finished.
#[derive(Debug, Clone)]
pub struct DelegationStage {
    pub assignments: BTreeMap<SubschemaId, Vec<Field>>,
    pub proxiable: Vec<SubschemaId>,
    pub non_proxiable: Vec<SubschemaId>,
    pub unproxiable_fields: Vec<Field>,
}

impl DelegationStage {
    pub fn selection_set(&self, subschema: SubschemaId) -> SelectionSet {
        let fields = self.assignments.get(&subschema).into_iter().flatten();
        selection_set(fields.cloned().map(Selection::Field).collect())
    }

    pub fn field_names(&self, subschema: SubschemaId) -> Vec<&str> {
        self.assignments
            .get(&subschema)
            .into_iter()
            .flatten()
            .map(|field| field.name.as_str())
            .collect()
    }
}

fn names_of(fields: &[Field]) -> Vec<&str> {
    fields.iter().map(|field| field.name.as_str()).collect()
}

#[derive(Debug, Clone, Default)]
pub struct DelegationPlan {
    pub stages: Vec<DelegationStage>,
    /// Fields no reachable subschema can resolve once planning converged.
    pub unproxiable_fields: Vec<Field>,
}

/// Assigns the fields of one merged object to subschemas, stage by stage,
/// starting from the subschemas that already produced part of the object.
pub struct DelegationPlanner<'a> {
    info: &'a MergedTypeInfo,
}

impl<'a> DelegationPlanner<'a> {
    pub fn new(info: &'a MergedTypeInfo) -> Self {
        DelegationPlanner { info }
    }

    pub fn plan(&self, sources: &[SubschemaId], fields: Vec<Field>) -> DelegationPlan {
        let mut sources = sources.to_vec();
        let mut remaining = fields;
        let mut stages = Vec::new();

        loop {
            let targets = self.info.targets_of(&sources);
            let stage = self.calculate_stage(&sources, &targets, &remaining);
            trace!(
                type_name = %self.info.type_name,
                stage = stages.len(),
                ?sources,
                assignments = ?stage
                    .assignments
                    .iter()
                    .map(|(id, fields)| (id.index(), names_of(fields)))
                    .collect::<Vec<_>>(),
                unproxiable = stage.unproxiable_fields.len(),
                "Planned delegation stage"
            );

            if stage.assignments.is_empty() {
                return DelegationPlan {
                    stages,
                    unproxiable_fields: stage.unproxiable_fields,
                };
            }

            for id in &stage.proxiable {
                if !sources.contains(id) {
                    sources.push(*id);
                }
            }
            remaining = stage.unproxiable_fields.clone();
            stages.push(stage);
        }
    }

    fn is_proxiable(&self, target: SubschemaId, sources: &[SubschemaId], fields: &[Field]) -> bool {
        if let Some(set) = self.info.selection_sets.get(&target) {
            if !self.info.selection_containment(sources, set) {
                return false;
            }
        }
        match self.info.field_selection_sets.get(&target) {
            Some(field_sets) => fields.iter().all(|field| {
                field_sets
                    .get(&field.name)
                    .is_none_or(|set| self.info.selection_containment(sources, set))
            }),
            None => true,
        }
    }

    fn calculate_stage(
        &self,
        sources: &[SubschemaId],
        targets: &[SubschemaId],
        fields: &[Field],
    ) -> DelegationStage {
        let (proxiable, non_proxiable): (Vec<SubschemaId>, Vec<SubschemaId>) = targets
            .iter()
            .copied()
            .partition(|target| self.is_proxiable(*target, sources, fields));

        let mut assignments: BTreeMap<SubschemaId, Vec<Field>> = BTreeMap::new();
        let mut unproxiable_fields = Vec::new();

        for field in fields {
            if field.name == TYPENAME_FIELD {
                continue;
            }
            let owner = match self.info.owners(&field.name) {
                FieldOwners::Unique(owner) => Some(owner).filter(|owner| proxiable.contains(owner)),
                FieldOwners::Shared(owners) => {
                    let candidates: Vec<SubschemaId> = owners
                        .iter()
                        .filter(|owner| proxiable.contains(owner))
                        .copied()
                        .collect();
                    // Reuse a subschema this stage already calls before
                    // adding another sub-request.
                    candidates
                        .iter()
                        .find(|candidate| assignments.contains_key(*candidate))
                        .or(candidates.first())
                        .copied()
                }
                FieldOwners::Unowned => None,
            };
            match owner {
                Some(owner) => assignments.entry(owner).or_default().push(field.clone()),
                None => unproxiable_fields.push(field.clone()),
            }
        }

        DelegationStage {
            assignments,
            proxiable,
            non_proxiable,
            unproxiable_fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        MergedTypeConfig, Subschema, query_executor::tests::NullExecutor, selection::plain_field,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn subschema(name: &str, sdl: &str) -> Subschema {
        Subschema::new(name, sdl, Arc::new(NullExecutor)).unwrap()
    }

    fn fields(names: &[&str]) -> Vec<Field> {
        names.iter().map(|name| plain_field(name)).collect()
    }

    fn book_info() -> MergedTypeInfo {
        let subschemas = vec![
            subschema("a", "type Query { a: Int } type Book { id: ID! title: String }"),
            subschema(
                "b",
                "type Query { bookById(id: ID!): Book } type Book { id: ID! isbn: String }",
            )
            .with_merged_type(
                "Book",
                MergedTypeConfig::by_key("bookById", "id").selection_set("{ id }"),
            ),
        ];
        MergedTypeInfo::build("Book", &subschemas).unwrap().unwrap()
    }

    #[test]
    fn delegates_key_dependent_field_after_source() {
        let info = book_info();
        let requested = fields(&["id", "title", "isbn"]);
        let refs: Vec<&Field> = requested.iter().collect();
        let remaining = info.fields_not_locally_resolvable(SubschemaId(0), &refs);

        let plan = DelegationPlanner::new(&info).plan(&[SubschemaId(0)], remaining);

        assert_eq!(plan.stages.len(), 1);
        assert_eq!(plan.stages[0].field_names(SubschemaId(1)), vec!["isbn"]);
        assert!(plan.unproxiable_fields.is_empty());
    }

    #[test]
    fn reports_fields_nobody_owns() {
        let info = book_info();
        let plan = DelegationPlanner::new(&info).plan(
            &[SubschemaId(0)],
            fields(&["isbn", "publisher", "__typename"]),
        );

        assert_eq!(plan.stages.len(), 1);
        let unproxiable: Vec<_> = plan.unproxiable_fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(unproxiable, vec!["publisher"]);
    }

    fn product_info() -> MergedTypeInfo {
        let subschemas = vec![
            subschema(
                "catalog",
                "type Query { product(id: ID!): Product } type Product { id: ID! name: String }",
            )
            .with_merged_type(
                "Product",
                MergedTypeConfig::by_key("product", "id").selection_set("{ id }"),
            ),
            subschema(
                "inventory",
                "type Query { stock(id: ID!): Product } type Product { id: ID! sku: String }",
            )
            .with_merged_type(
                "Product",
                MergedTypeConfig::by_key("stock", "id").selection_set("{ id }"),
            ),
            subschema(
                "pricing",
                r#"
                type Query { price(sku: String!): Product }
                type Product { sku: String price: Float }
                "#,
            )
                .with_merged_type(
                    "Product",
                    MergedTypeConfig::by_key("price", "sku")
                        .field_selection_set("price", "{ sku }"),
                ),
        ];
        MergedTypeInfo::build("Product", &subschemas).unwrap().unwrap()
    }

    #[test]
    fn plans_multi_hop_delegation_in_order() {
        let info = product_info();
        let requested = fields(&["name", "price"]);
        let refs: Vec<&Field> = requested.iter().collect();
        let remaining = info.fields_not_locally_resolvable(SubschemaId(0), &refs);
        let names: Vec<_> = remaining.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["price", "sku"]);

        let plan = DelegationPlanner::new(&info).plan(&[SubschemaId(0)], remaining);

        assert_eq!(plan.stages.len(), 2);
        assert_eq!(plan.stages[0].field_names(SubschemaId(1)), vec!["sku"]);
        assert_eq!(plan.stages[0].non_proxiable, vec![SubschemaId(2)]);
        assert_eq!(plan.stages[1].field_names(SubschemaId(2)), vec!["price"]);
        assert!(plan.unproxiable_fields.is_empty());

        // Remaining fields shrink while the reachable subschemas only grow.
        let sizes: Vec<usize> = plan
            .stages
            .iter()
            .map(|stage| stage.unproxiable_fields.len())
            .collect();
        assert!(sizes.windows(2).all(|pair| pair[0] >= pair[1]));
        assert!(plan.stages[0].proxiable.iter().all(|id| !plan.stages[1].proxiable.contains(id)));
    }

    #[test]
    fn converges_when_a_key_is_never_supplied() {
        let info = product_info();
        // Without `sku` among the requested fields the pricing subschema can
        // never become proxiable.
        let plan = DelegationPlanner::new(&info).plan(&[SubschemaId(0)], fields(&["price"]));

        assert!(plan.stages.is_empty());
        let unproxiable: Vec<_> = plan.unproxiable_fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(unproxiable, vec!["price"]);
    }

    #[test]
    fn prefers_a_subschema_already_in_the_stage() {
        let subschemas = vec![
            subschema("source", "type Query { a: Int } type Book { id: ID! }"),
            subschema(
                "titles",
                "type Query { t(id: ID!): Book } type Book { id: ID! title: String }",
            )
                .with_merged_type("Book", MergedTypeConfig::by_key("t", "id")),
            subschema(
                "details",
                "type Query { d(id: ID!): Book } type Book { id: ID! title: String isbn: String }",
            )
                .with_merged_type("Book", MergedTypeConfig::by_key("d", "id")),
        ];
        let info = MergedTypeInfo::build("Book", &subschemas).unwrap().unwrap();
        let planner = DelegationPlanner::new(&info);

        let plan = planner.plan(&[SubschemaId(0)], fields(&["isbn", "title"]));
        assert_eq!(plan.stages.len(), 1);
        assert_eq!(plan.stages[0].assignments.len(), 1);
        assert_eq!(plan.stages[0].field_names(SubschemaId(2)), vec!["isbn", "title"]);

        let plan = planner.plan(&[SubschemaId(0)], fields(&["title", "isbn"]));
        assert_eq!(plan.stages[0].field_names(SubschemaId(1)), vec!["title"]);
        assert_eq!(plan.stages[0].field_names(SubschemaId(2)), vec!["isbn"]);
    }

    #[test]
    fn planning_is_deterministic() {
        let info = product_info();
        let planner = DelegationPlanner::new(&info);
        let first = planner.plan(&[SubschemaId(0)], fields(&["price", "sku", "name"]));
        let second = planner.plan(&[SubschemaId(0)], fields(&["price", "sku", "name"]));
        let shape = |plan: &DelegationPlan| -> Vec<Vec<(SubschemaId, Vec<String>)>> {
            plan.stages
                .iter()
                .map(|stage| {
                    stage
                        .assignments
                        .iter()
                        .map(|(id, fields)| (*id, names_of(fields).into_iter().map(String::from).collect()))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(&first), shape(&second));
    }
}
