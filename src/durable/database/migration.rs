//! Schema migration for the record table.

pub use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FlowRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FlowRecords::Key)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(FlowRecords::Value).json().not_null())
                    .col(ColumnDef::new(FlowRecords::Ttl).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(FlowRecords::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_flow_records_ttl")
                    .table(FlowRecords::Table)
                    .col(FlowRecords::Ttl)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(FlowRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum FlowRecords {
    Table,
    Key,
    Value,
    Ttl,
    CreatedAt,
}

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(Migration)]
    }
}
