use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub async fn connect_pg(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("database ready");
    Ok(pool)
}
