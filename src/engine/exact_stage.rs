use serde::Serialize;

use super::context::{MatchContext, SideLayout};
use crate::db::{RelationalStore, quote_ident, quote_literal};
use crate::error::{MatchError, Stage};
use crate::normalize::{EXACT_KEY_SEPARATOR, KEY_BLANKS};

/// Relations produced by the exact stage.
#[derive(Debug, Clone, Serialize)]
pub struct ExactStageOutcome {
    pub exact_relation: String,
    pub exact_rows: u64,
    pub reduced_left: String,
    pub reduced_left_rows: u64,
    pub reduced_right: String,
    pub reduced_right_rows: u64,
}

/// Text of `attribute` with every key blank removed, NULL as empty.
fn stripped(attribute: &str) -> String {
    KEY_BLANKS.iter().fold(
        format!("COALESCE(CAST({} AS TEXT), '')", quote_ident(attribute)),
        |expr, c| format!("REPLACE({}, char({}), '')", expr, u32::from(*c)),
    )
}

/// SQL composite key: blank-stripped values joined by `_`.
fn key_expr(attributes: &[String]) -> String {
    attributes
        .iter()
        .map(|a| stripped(a))
        .collect::<Vec<_>>()
        .join(&format!(" || {} || ", quote_literal(EXACT_KEY_SEPARATOR)))
}

/// The stripped values without separators; empty means no key material.
fn material_expr(attributes: &[String]) -> String {
    attributes
        .iter()
        .map(|a| stripped(a))
        .collect::<Vec<_>>()
        .join(" || ")
}

fn aliased_projection(side: &SideLayout) -> String {
    side.projection
        .iter()
        .map(|c| format!("{} AS {}", quote_ident(c), quote_ident(&side.prefixed(c))))
        .collect::<Vec<_>>()
        .join(", ")
}

fn qualified_projection(alias: &str, side: &SideLayout) -> Vec<String> {
    side.prefixed_projection()
        .iter()
        .map(|c| format!("{}.{}", alias, quote_ident(c)))
        .collect()
}

/// Rows of the source relation whose key was joined exactly.
fn matched_filter(side: &SideLayout, exact_relation: &str) -> String {
    let attrs = &side.key_attributes;
    format!(
        " WHERE NOT ({} <> '' AND {} IN (SELECT {} FROM {}))",
        material_expr(attrs),
        key_expr(attrs),
        quote_ident(&side.match_key_column()),
        quote_ident(exact_relation)
    )
}

async fn keyed_relation<S: RelationalStore>(
    store: &S,
    side: &SideLayout,
    hint: &str,
    temporaries: &mut Vec<String>,
) -> Result<String, MatchError> {
    let fail = || MatchError::store(Stage::Exact);
    let name = store.fresh_temporary_name(Some(hint)).await.map_err(fail())?;
    temporaries.push(name.clone());
    let key_column = side.match_key_column();
    let sql = format!(
        "CREATE TABLE {} AS SELECT {} AS {}, {} FROM {} WHERE {} <> ''",
        quote_ident(&name),
        key_expr(&side.key_attributes),
        quote_ident(&key_column),
        aliased_projection(side),
        quote_ident(&side.relation.name),
        material_expr(&side.key_attributes)
    );
    store.execute(&sql).await.map_err(fail())?;
    store
        .create_index(&name, &key_column, &format!("{}_{}_index", name, key_column))
        .await
        .map_err(fail())?;
    Ok(name)
}

async fn reduced_relation<S: RelationalStore>(
    store: &S,
    side: &SideLayout,
    hint: &str,
    filter: Option<String>,
    temporaries: &mut Vec<String>,
) -> Result<String, MatchError> {
    let fail = || MatchError::store(Stage::Exact);
    let name = store.fresh_temporary_name(Some(hint)).await.map_err(fail())?;
    temporaries.push(name.clone());
    let sql = format!(
        "CREATE TABLE {} AS SELECT {} FROM {}{}",
        quote_ident(&name),
        aliased_projection(side),
        quote_ident(&side.relation.name),
        filter.unwrap_or_default()
    );
    store.execute(&sql).await.map_err(fail())?;
    Ok(name)
}

/// Join both relations on their whitespace-free composite keys into
/// `<target>_exact_matches` and build the reduced sets left for fuzzy
/// matching. Every relation created here is recorded in `temporaries`
/// before it is created so the caller can clean up after a failure.
pub async fn run_exact_stage<S: RelationalStore>(
    store: &S,
    ctx: &MatchContext,
    temporaries: &mut Vec<String>,
) -> Result<ExactStageOutcome, MatchError> {
    let fail = || MatchError::store(Stage::Exact);
    log::info!(
        "looking for exact matches between {} and {} (whitespace ignored)",
        ctx.left.relation.name,
        ctx.right.relation.name
    );

    let left_keyed = keyed_relation(store, &ctx.left, "left_all_plus_key", temporaries).await?;
    let right_keyed =
        keyed_relation(store, &ctx.right, "right_all_plus_key", temporaries).await?;

    let exact_relation = ctx.exact_matches_name();
    store.drop_if_exists(&exact_relation).await.map_err(fail())?;
    let mut select = qualified_projection("l", &ctx.left);
    select.extend(qualified_projection("r", &ctx.right));
    select.push(format!("l.{}", quote_ident(&ctx.left.match_key_column())));
    select.push(format!("r.{}", quote_ident(&ctx.right.match_key_column())));
    let join = format!(
        "CREATE TABLE {} AS SELECT {} FROM {} l INNER JOIN {} r ON l.{} = r.{}",
        quote_ident(&exact_relation),
        select.join(", "),
        quote_ident(&left_keyed),
        quote_ident(&right_keyed),
        quote_ident(&ctx.left.match_key_column()),
        quote_ident(&ctx.right.match_key_column())
    );
    store.execute(&join).await.map_err(fail())?;
    let exact_rows = store.row_count(&exact_relation).await.map_err(fail())?;
    let left_total = store
        .row_count(&ctx.left.relation.name)
        .await
        .map_err(fail())?;
    log::info!("exact matches: {} of {}", exact_rows, left_total);

    let left_filter =
        (!ctx.options.hungry_left).then(|| matched_filter(&ctx.left, &exact_relation));
    let right_filter =
        ctx.options.greedy_left.then(|| matched_filter(&ctx.right, &exact_relation));
    let reduced_left =
        reduced_relation(store, &ctx.left, "reduced_left", left_filter, temporaries).await?;
    let reduced_right =
        reduced_relation(store, &ctx.right, "reduced_right", right_filter, temporaries).await?;
    let reduced_left_rows = store.row_count(&reduced_left).await.map_err(fail())?;
    let reduced_right_rows = store.row_count(&reduced_right).await.map_err(fail())?;
    log::info!(
        "reduced sets: {} left rows, {} right rows",
        reduced_left_rows,
        reduced_right_rows
    );

    Ok(ExactStageOutcome {
        exact_relation,
        exact_rows,
        reduced_left,
        reduced_left_rows,
        reduced_right,
        reduced_right_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::{SqliteStore, make_pool};
    use crate::matching::{MatchOption, MatchSpecification};
    use crate::models::RelationRef;
    use crate::normalize::exact_key;

    async fn store() -> SqliteStore {
        let s = SqliteStore::new(make_pool(&DatabaseConfig::default()).await.unwrap());
        s.execute("CREATE TABLE l (id TEXT, first TEXT, last TEXT)")
            .await
            .unwrap();
        s.execute("CREATE TABLE r (id TEXT, first TEXT, last TEXT)")
            .await
            .unwrap();
        s.execute(
            "INSERT INTO l VALUES ('1','Ann','Lee'), ('2','Bob','Ray'), ('3',NULL,NULL), ('4','Cy',' Po')",
        )
        .await
        .unwrap();
        s.execute(
            "INSERT INTO r VALUES ('7','A nn','Lee'), ('8','Ann','Lee'), ('9',NULL,NULL), ('10','Cyd','Po')",
        )
        .await
        .unwrap();
        s
    }

    async fn ctx(s: &SqliteStore, options: &[MatchOption]) -> MatchContext {
        let spec = MatchSpecification::new(
            vec!["first".into(), "last".into()],
            vec!["first".into(), "last".into()],
            options,
        )
        .unwrap();
        let l = RelationRef::discover(s, "l").await.unwrap();
        let r = RelationRef::discover(s, "r").await.unwrap();
        MatchContext::new(l, r, &spec, "m", None).unwrap()
    }

    #[test]
    fn key_expression_shape() {
        let e = key_expr(&["a".to_string(), "b".to_string()]);
        let strip = |c: &str| {
            format!(
                "REPLACE(REPLACE(REPLACE(REPLACE(COALESCE(CAST(\"{}\" AS TEXT), ''), char(32), ''), char(9), ''), char(10), ''), char(13), '')",
                c
            )
        };
        assert_eq!(e, format!("{} || '_' || {}", strip("a"), strip("b")));
    }

    #[tokio::test]
    async fn joins_on_stripped_keys_and_reduces_left() {
        let s = store().await;
        let c = ctx(&s, &[]).await;
        let mut temps = Vec::new();
        let out = run_exact_stage(&s, &c, &mut temps).await.unwrap();
        assert_eq!(out.exact_relation, "m_exact_matches");
        // Ann Lee matches both 'A nn' and 'Ann'; all-null rows never join
        assert_eq!(out.exact_rows, 2);
        assert_eq!(
            s.column_names("m_exact_matches").await.unwrap(),
            vec!["l_first", "l_last", "r_first", "r_last", "l_match_key", "r_match_key"]
        );
        let keys = s
            .run_query("SELECT l_match_key, r_first FROM m_exact_matches ORDER BY r_first")
            .await
            .unwrap();
        assert_eq!(
            keys.value(0, "l_match_key"),
            Some(exact_key(["Ann", "Lee"]).as_str())
        );
        assert_eq!(keys.value(0, "r_first"), Some("A nn"));
        // left: Bob Ray, the all-null row and Cy Po stay; right keeps everything
        assert_eq!(out.reduced_left_rows, 3);
        assert_eq!(out.reduced_right_rows, 4);
        assert_eq!(
            s.column_names(&out.reduced_left).await.unwrap(),
            vec!["l_first", "l_last"]
        );
        assert_eq!(temps.len(), 4);
    }

    #[tokio::test]
    async fn tabs_and_line_breaks_do_not_split_keys() {
        let s = SqliteStore::new(make_pool(&DatabaseConfig::default()).await.unwrap());
        s.execute("CREATE TABLE l (first TEXT, last TEXT)").await.unwrap();
        s.execute("CREATE TABLE r (first TEXT, last TEXT)").await.unwrap();
        s.execute("INSERT INTO l VALUES ('Ann' || char(9) || 'Lee', 'Po' || char(13) || char(10))")
            .await
            .unwrap();
        s.execute("INSERT INTO r VALUES ('AnnLee', ' Po')").await.unwrap();
        let c = ctx(&s, &[]).await;
        let mut temps = Vec::new();
        let out = run_exact_stage(&s, &c, &mut temps).await.unwrap();
        assert_eq!(out.exact_rows, 1);
        assert_eq!(out.reduced_left_rows, 0);
        let keys = s
            .run_query("SELECT l_match_key FROM m_exact_matches")
            .await
            .unwrap();
        assert_eq!(
            keys.value(0, "l_match_key"),
            Some(exact_key(["Ann\tLee", "Po\r\n"]).as_str())
        );
    }

    #[tokio::test]
    async fn hungry_and_greedy_flags_control_reduction() {
        let s = store().await;
        let c = ctx(&s, &[MatchOption::HungryLeft, MatchOption::GreedyLeft]).await;
        let mut temps = Vec::new();
        let out = run_exact_stage(&s, &c, &mut temps).await.unwrap();
        assert_eq!(out.reduced_left_rows, 4);
        assert_eq!(out.reduced_right_rows, 2);
    }

    #[tokio::test]
    async fn missing_relation_fails_in_exact_stage() {
        let s = store().await;
        let mut c = ctx(&s, &[]).await;
        c.left.relation.name = "gone".into();
        let mut temps = Vec::new();
        let err = run_exact_stage(&s, &c, &mut temps).await.unwrap_err();
        assert!(matches!(
            err,
            MatchError::Store {
                stage: Stage::Exact,
                ..
            }
        ));
        assert_eq!(temps.len(), 1);
    }
}
