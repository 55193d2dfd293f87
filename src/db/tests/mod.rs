mod tests_schema;
